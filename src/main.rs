//! voxlink - Encrypted real-time voice chat client

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, trace, warn, Level};
use tracing_subscriber::FmtSubscriber;

use voxlink::audio::{
    create_codec, list_input_devices, list_output_devices, AudioDevice, CodecConfig, CpalCapture,
    RemoteUser, StreamFormat, Transmitter,
};
use voxlink::config::{ClientConfig, DEFAULT_PORT};
use voxlink::handler::{RoomHandler, RoomMessage};
use voxlink::network::{ClientEvent, ClientOptions, UdpClient, UdpHost};
use voxlink::protocol::ChannelId;

#[derive(Parser)]
#[command(name = "voxlink")]
#[command(about = "Encrypted real-time voice chat client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Connect to a voice server
    Connect {
        /// Server host name or address
        #[arg(long, env = "VOXLINK_HOST")]
        host: String,

        /// Server port
        #[arg(short, long, env = "VOXLINK_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Your display name
        #[arg(short, long, env = "VOXLINK_NAME", default_value = "CLI User")]
        name: String,

        #[command(flatten)]
        audio: AudioArgs,
    },

    /// Echo the microphone to the speakers through the codec and jitter buffer
    EchoTest {
        /// How long to run in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,

        #[command(flatten)]
        audio: AudioArgs,
    },
}

#[derive(clap::Args)]
struct AudioArgs {
    /// Input device name (use 'devices list' to see available devices)
    #[arg(long, env = "VOXLINK_INPUT_DEVICE")]
    input_device: Option<String>,

    /// Output device name (use 'devices list' to see available devices)
    #[arg(long, env = "VOXLINK_OUTPUT_DEVICE")]
    output_device: Option<String>,

    /// Jitter buffer depth in frames
    #[arg(long, default_value = "3")]
    jitter_buffer: usize,

    /// Frame size in samples per channel
    #[arg(long, default_value = "1920")]
    frame_size: usize,
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List all devices
    List,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn print_devices(devices: &[AudioDevice]) {
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        let default_marker = if device.is_default { " (default)" } else { "" };
        println!("  - {}{}", device.name, default_marker);
    }
}

fn list_devices() {
    println!("Input devices:");
    print_devices(&list_input_devices());

    println!("\nOutput devices:");
    print_devices(&list_output_devices());
}

impl AudioArgs {
    fn into_config(self) -> ClientConfig {
        ClientConfig {
            input_device: self.input_device,
            output_device: self.output_device,
            jitter_buffer_size: self.jitter_buffer,
            frame_size: self.frame_size,
            ..Default::default()
        }
    }
}

fn stream_format(codec: &CodecConfig) -> StreamFormat {
    StreamFormat {
        sample_rate: codec.sample_rate,
        channels: codec.channels,
        frame_size: codec.frame_size,
    }
}

fn print_room_message(message: RoomMessage) {
    match message {
        RoomMessage::Joined(user) => println!("* {} joined", user.name),
        RoomMessage::Left { id, name } => {
            println!("* {} left", name.unwrap_or_else(|| format!("user {}", id)))
        }
        RoomMessage::Chat { from, name, text } => {
            println!("{}: {}", name.unwrap_or_else(|| format!("user {}", from)), text)
        }
    }
}

fn prompt() {
    print!("voice> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

async fn run_connect(config: ClientConfig) -> Result<()> {
    let codec = config.codec_config();

    let output_device = config.output_device_id();
    let jitter_buffer_size = config.jitter_buffer_size;
    let user_codec = codec.clone();
    let (handler, mut room_rx) = RoomHandler::new(Box::new(move |id, name| {
        RemoteUser::open(
            id,
            name,
            output_device.as_ref(),
            &user_codec,
            jitter_buffer_size,
        )
    }));

    let options = ClientOptions::new(config.server_address());
    let (client, mut events) = UdpClient::new(UdpHost::new()?, options, handler)?;
    let client = Arc::new(client);

    let capture = CpalCapture::new(config.input_device_id(), stream_format(&codec));
    let sender = client.clone();
    let mut transmitter = Transmitter::spawn(
        Box::new(capture),
        create_codec(&codec)?,
        codec.samples_per_frame(),
        move |packet| {
            if let Err(e) = sender.send_audio(&packet) {
                trace!("Voice frame not sent: {}", e);
            }
        },
    )?;

    client.connect()?;
    println!("Connecting to {}...", config.server_address());
    println!("Press Enter to toggle talking, /say <text> to chat, /connect to reconnect, /quit to exit.\n");

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            Some(event) = events.recv() => {
                match event {
                    ClientEvent::Connected => {
                        println!("Connected as {}", config.name);
                        if let Err(e) = client.send(ChannelId::Control, "join", json!({ "name": config.name })) {
                            warn!("Failed to announce name: {}", e);
                        }
                    }
                    ClientEvent::Disconnected => {
                        transmitter.set_transmitting(false);
                        println!("Disconnected");
                    }
                    ClientEvent::ConnectionTimeout => {
                        transmitter.set_transmitting(false);
                        println!("Connection timed out");
                    }
                }
                prompt();
            }
            Some(message) = room_rx.recv() => {
                print_room_message(message);
                prompt();
            }
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line == "/quit" {
                            break;
                        } else if line == "/connect" {
                            if let Err(e) = client.connect() {
                                warn!("Failed to connect: {}", e);
                            }
                        } else if let Some(text) = line.strip_prefix("/say ") {
                            if let Err(e) = client.send(ChannelId::Control, "message", json!({ "text": text })) {
                                println!("Not sent: {}", e);
                            }
                        } else if line.is_empty() {
                            let talking = !transmitter.is_transmitting();
                            transmitter.set_transmitting(talking);
                            println!("{}", if talking { "Talking" } else { "Muted" });
                        } else {
                            println!("Unknown command: {}", line);
                        }
                        prompt();
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    transmitter.destroy();
    drop(transmitter);
    // Last reference: dropping the client disconnects and joins its thread
    drop(client);
    Ok(())
}

async fn run_echo_test(seconds: u64, audio: AudioArgs) -> Result<()> {
    let config = audio.into_config();
    if let Err(e) = config.validate_audio() {
        bail!("Invalid configuration: {}", e);
    }
    let codec = config.codec_config();

    let output = RemoteUser::open(
        0,
        "echo",
        config.output_device_id().as_ref(),
        &codec,
        config.jitter_buffer_size,
    )?;

    let capture = CpalCapture::new(config.input_device_id(), stream_format(&codec));
    let mut transmitter = Transmitter::spawn(
        Box::new(capture),
        create_codec(&codec)?,
        codec.samples_per_frame(),
        move |packet| output.put_packet(&packet),
    )?;
    transmitter.set_transmitting(true);

    println!("Echoing input to output for {} seconds. Press Ctrl+C to stop.", seconds);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Echo test interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
    }

    transmitter.destroy();
    println!("Echo test finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Devices { action } => match action {
            DevicesAction::List => list_devices(),
        },
        Commands::Connect {
            host,
            port,
            name,
            audio,
        } => {
            let config = ClientConfig {
                host,
                port,
                name,
                ..audio.into_config()
            };
            if let Err(e) = config.validate() {
                bail!("Invalid configuration: {}", e);
            }
            run_connect(config).await?;
        }
        Commands::EchoTest { seconds, audio } => {
            run_echo_test(seconds, audio).await?;
        }
    }

    Ok(())
}
