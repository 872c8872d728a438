mod cli;

use aura_live::audio::{self, CpalInput, CpalOutput};
use aura_live::controller::{SessionConfig, SessionController, SessionEvent, Speaker};
use aura_live::credentials;
use aura_live::gemini::{self, live::GeminiLive};
use aura_live::settings::{self, Settings};
use aura_live::studio::{self, Media, StudioClient};
use aura_live::transport::SessionState;
use aura_live::visualizer::{NullRenderer, SpectrumRenderer, TerminalBars};
use clap::Parser;
use cli::{Args, Command, KeyAction};
use log::{error, info, warn};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    cli::init_logging(&args);

    let settings = settings::load();
    let command = args.command.unwrap_or(Command::Chat {
        mic: None,
        voice: None,
        no_bars: false,
    });
    if let Err(e) = run(command, settings).await {
        error!("[aura] {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, mut settings: Settings) -> Result<(), String> {
    match command {
        Command::Chat {
            mic,
            voice,
            no_bars,
        } => {
            if let Some(mic) = mic {
                settings.mic_device = mic;
            }
            if let Some(voice) = voice {
                settings.voice = voice;
            }
            chat(settings, !no_bars).await
        }
        Command::Devices => {
            println!("Input devices:");
            for name in audio::list_input_devices() {
                println!("  {}", name);
            }
            println!("Output devices:");
            for name in audio::list_output_devices() {
                println!("  {}", name);
            }
            Ok(())
        }
        Command::Key { action } => match action {
            KeyAction::Set { key } => {
                let client = reqwest::Client::new();
                gemini::verify_api_key(&client, &key)
                    .await
                    .map_err(|e| e.to_string())?;
                credentials::save_api_key(&key)?;
                println!("API key verified and saved ({})", credentials::redact(key.trim()));
                Ok(())
            }
            KeyAction::Clear => {
                credentials::save_api_key("")?;
                println!("Stored API key removed");
                Ok(())
            }
        },
        Command::Image {
            prompt,
            aspect,
            size,
            out,
        } => {
            let client = studio_client(&settings)?;
            let uri = client
                .generate_image(&prompt, aspect.parse()?, size.parse()?)
                .await
                .map_err(|e| e.to_string())?;
            write_data_uri(&uri, &out)
        }
        Command::Edit { input, prompt, out } => {
            let client = studio_client(&settings)?;
            let image = Media::from_path(&input)?;
            let uri = client
                .edit_image(&image, &prompt)
                .await
                .map_err(|e| e.to_string())?;
            write_data_uri(&uri, &out)
        }
        Command::Video {
            prompt,
            image,
            aspect,
            out,
        } => {
            let client = studio_client(&settings)?;
            let image = image.as_deref().map(Media::from_path).transpose()?;
            println!("Generating video, this can take a few minutes...");
            let bytes = client
                .generate_video(&prompt, image.as_ref(), aspect.parse()?)
                .await
                .map_err(|e| e.to_string())?;
            std::fs::write(&out, &bytes)
                .map_err(|e| format!("Failed to write {}: {}", out.display(), e))?;
            println!("Saved {} ({:.1}MB)", out.display(), bytes.len() as f64 / 1_048_576.0);
            Ok(())
        }
        Command::Analyze { input, prompt } => {
            let client = studio_client(&settings)?;
            let video = Media::from_path(&input)?;
            let text = client
                .analyze_video(&video, &prompt)
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", text);
            Ok(())
        }
    }
}

fn require_api_key() -> Result<String, String> {
    credentials::load_api_key()?.ok_or_else(|| {
        "no API key: set GEMINI_API_KEY or run `aura key set <KEY>`".to_string()
    })
}

fn studio_client(settings: &Settings) -> Result<StudioClient, String> {
    Ok(StudioClient::new(require_api_key()?, settings))
}

fn write_data_uri(uri: &str, out: &Path) -> Result<(), String> {
    let (mime, bytes) = studio::decode_data_uri(uri).map_err(|e| e.to_string())?;
    std::fs::write(out, &bytes).map_err(|e| format!("Failed to write {}: {}", out.display(), e))?;
    println!("Saved {} ({}, {} bytes)", out.display(), mime, bytes.len());
    Ok(())
}

enum Step {
    Line(Option<String>),
    Incoming(aura_live::controller::Incoming),
    Event(Option<SessionEvent>),
    Quit,
}

async fn chat(settings: Settings, show_bars: bool) -> Result<(), String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let http = reqwest::Client::new();

    let api_key = match credentials::load_api_key()? {
        Some(key) => key,
        None => {
            println!("No API key found.");
            reauthenticate(&mut lines, &http)
                .await
                .ok_or("an API key is required for chat")?
        }
    };

    let connector = GeminiLive::new(api_key).with_endpoint(settings.live_endpoint.clone());
    let (controller, mut events) = SessionController::new(
        connector,
        CpalInput::new(settings.mic_device()),
        CpalOutput::new(settings.output_device()),
        SessionConfig::from_settings(&settings),
    );
    let mut controller = controller.with_renderer(move || -> Box<dyn SpectrumRenderer> {
        if show_bars {
            Box::new(TerminalBars::default())
        } else {
            Box::new(NullRenderer)
        }
    });

    println!("Commands: m = mute/unmute, d = disconnect, c = connect, s = status, q = quit");
    if let Err(e) = controller.connect().await {
        warn!("[aura] initial connect failed: {}", e);
    }

    loop {
        let step = tokio::select! {
            line = lines.next_line() => Step::Line(line.ok().flatten()),
            incoming = controller.next_incoming() => Step::Incoming(incoming),
            event = events.recv() => Step::Event(event),
            _ = tokio::signal::ctrl_c() => Step::Quit,
        };

        match step {
            Step::Incoming(incoming) => controller.handle_incoming(incoming),
            Step::Event(Some(event)) => {
                if let SessionEvent::ReauthRequired(reason) = &event {
                    println!("\nThe API rejected the key: {}", reason);
                    if let Some(key) = reauthenticate(&mut lines, &http).await {
                        controller.connector_mut().set_api_key(key);
                        if let Err(e) = controller.connect().await {
                            warn!("[aura] reconnect failed: {}", e);
                        }
                    }
                    continue;
                }
                print_event(&event);
            }
            Step::Event(None) => break,
            Step::Line(None) | Step::Quit => break,
            Step::Line(Some(line)) => match line.trim() {
                "m" => {
                    controller.toggle_mute();
                }
                "d" => controller.disconnect(),
                "c" => {
                    if controller.state() == SessionState::Disconnected {
                        if let Err(e) = controller.connect().await {
                            warn!("[aura] connect failed: {}", e);
                        }
                    } else {
                        println!("Already {}", controller.state());
                    }
                }
                "s" => {
                    let stats = controller.stats();
                    println!(
                        "state={} muted={} sent={} muted_frames={} received={} decode_errors={}",
                        controller.state(),
                        controller.is_muted(),
                        stats.frames_sent,
                        stats.frames_muted,
                        stats.payloads_received,
                        stats.decode_errors
                    );
                }
                "q" => break,
                "" => {}
                other => println!("Unknown command '{}'", other),
            },
        }
    }

    controller.disconnect();
    info!("[aura] bye");
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => println!("\n[{}]", state),
        SessionEvent::MuteChanged(muted) => {
            println!("\nMicrophone {}", if *muted { "muted" } else { "live" })
        }
        SessionEvent::Error(message) => println!("\nError: {}", message),
        SessionEvent::ReauthRequired(message) => println!("\nCredential rejected: {}", message),
        SessionEvent::Transcript { speaker, text } => {
            let who = match speaker {
                Speaker::User => "you",
                Speaker::Model => "aura",
            };
            println!("\n{}: {}", who, text.trim());
        }
        SessionEvent::Interrupted => println!("\n(interrupted)"),
        SessionEvent::TurnComplete => {}
        SessionEvent::GoAway(time_left) => {
            println!("\nServer will close the session in {}", time_left)
        }
    }
}

/// Ask for a key, verify it, store it. `None` when the user gives up.
async fn reauthenticate(lines: &mut StdinLines, http: &reqwest::Client) -> Option<String> {
    loop {
        println!("Enter a Gemini API key (blank to skip):");
        let line = lines.next_line().await.ok().flatten()?;
        let key = line.trim().to_string();
        if key.is_empty() {
            return None;
        }
        match gemini::verify_api_key(http, &key).await {
            Ok(()) => {
                if let Err(e) = credentials::save_api_key(&key) {
                    warn!("[aura] key verified but not saved: {}", e);
                }
                println!("Key accepted ({})", credentials::redact(&key));
                return Some(key);
            }
            Err(e) if e.needs_reauth() => println!("Key rejected: {}", e),
            Err(e) => {
                println!("Could not verify key: {}", e);
                return None;
            }
        }
    }
}
