use anyhow::{bail, Context, Result};
use std::path::Path;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vigil_core::{FaceDetector, FaceMesh, FrameLoop, SessionDriver, Shutdown};
use vigil_hw::{Camera, Microphone};
use vigil_voice::{ApiEndpoint, ChatClient, ChatConfig, CommandSynthesizer, TranscriptionClient, TranscriptionConfig};

mod config;
mod display;
mod font;
mod listener;

use config::Config;
use display::{Display, HeadlessDisplay, WindowDisplay};
use listener::MicrophoneListener;

#[derive(Parser)]
#[command(name = "vigil", about = "Drowsiness monitor with a spoken wake-up dialogue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the camera and start a conversation when the eyes stay closed (default)
    Run,
    /// List camera and microphone devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(Config::from_env()),
        Commands::Devices => {
            list_devices();
            Ok(())
        }
    }
}

fn run(config: Config) -> Result<()> {
    config.validate().context("invalid configuration")?;

    tracing::info!(
        camera = %config.camera_device,
        model = %config.face_mesh_model_path(),
        ear_threshold = config.ear_threshold,
        closure_secs = config.closure_secs,
        "vigil starting"
    );

    if config.api_key.is_empty() {
        tracing::warn!("VIGIL_API_KEY is not set; chat and transcription requests will be rejected");
    }

    // Voice side first: failing here should not leave the camera streaming.
    let endpoint = ApiEndpoint {
        base_url: config.api_base.clone(),
        api_key: config.api_key.clone(),
        timeout: config.http_timeout(),
    };
    let backend = ChatClient::new(ChatConfig::new(endpoint.clone(), config.chat_model.clone()))?;
    let transcriber = TranscriptionClient::new(TranscriptionConfig {
        endpoint,
        model: config.transcribe_model.clone(),
        language: config.language.clone(),
    })?;
    let synthesizer = CommandSynthesizer::from_command_line(&config.tts_command)
        .context("VIGIL_TTS_COMMAND is empty")?;
    let microphone = Microphone::open_default().context("failed to open microphone")?;
    tracing::info!(
        sample_rate = microphone.sample_rate(),
        tts = synthesizer.program(),
        "voice pipeline ready"
    );

    let listener = MicrophoneListener::new(microphone, transcriber, config.record_limits());
    let session = SessionDriver::new(config.session(), listener, synthesizer, backend);

    let mut detector = FaceMesh::load(&config.face_mesh_model_path(), config.face_mesh())
        .context("failed to load face mesh model")?;
    let detector_path = config.face_detector_model_path();
    if Path::new(&detector_path).exists() {
        let faces = FaceDetector::load(&detector_path).context("failed to load face detector model")?;
        detector = detector.with_detector(faces);
    } else if config.face_detector_model.is_some() {
        bail!("face detector model not found: {detector_path}");
    } else {
        tracing::warn!(
            path = %detector_path,
            "no face detector model; face mesh will search the whole frame"
        );
    }
    tracing::info!("landmark pipeline loaded");

    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    let mut stream = camera.stream()?;
    stream.warm_up(config.warmup_frames)?;

    let mut display = if config.display {
        Display::Window(WindowDisplay::open(camera.width, camera.height)?)
    } else {
        tracing::info!("display disabled; running headless");
        Display::Headless(HeadlessDisplay::default())
    };

    let mut frame_loop = FrameLoop::new(
        detector,
        config.eye_landmarks()?,
        config.drowsiness(),
        session,
    );

    tracing::info!("vigil ready");

    match frame_loop.run(&mut stream, &mut display)? {
        Shutdown::QuitRequested => {
            tracing::info!(blink_count = frame_loop.blink_count(), "vigil shutting down");
        }
    }

    Ok(())
}

fn list_devices() {
    let cameras = Camera::list_devices();
    if cameras.is_empty() {
        println!("No V4L2 capture devices found");
    } else {
        println!("Cameras:");
        for dev in cameras {
            println!("  {}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
        }
    }

    let inputs = vigil_hw::list_input_devices();
    if inputs.is_empty() {
        println!("No audio input devices found");
    } else {
        println!("Microphones:");
        for name in inputs {
            println!("  {name}");
        }
    }
}
