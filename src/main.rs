use std::io::BufRead;
use std::sync::Arc;

use kiwi::{Config, EngineCommand, EngineUpdate, UreqTransport, audio, spawn_engine};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiwi=info")),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let api_key = config.load_api_key();
    if api_key.is_none() {
        warn!("no API key found, prompts will fail until one is set");
    }

    let transport = Arc::new(UreqTransport::new(config.timeout(), config.max_redirects));
    let (engine, wiring) = spawn_engine(&config, api_key, transport);

    let _audio = match audio::start(wiring, config.midi_port.as_deref()) {
        Ok(host) => host,
        Err(e) => {
            error!("{e}");
            engine.shutdown();
            std::process::exit(1);
        }
    };

    let updates = engine.update_rx.clone();
    std::thread::spawn(move || {
        for update in updates {
            match update {
                EngineUpdate::GenerationStarted { prompt } => println!("Generating: {prompt}"),
                EngineUpdate::GenerationFinished { note_count } => {
                    println!("Received {note_count} notes, playing")
                }
                EngineUpdate::SequenceFinished { replay, midi_file } => {
                    let label = if replay { "Replay finished" } else { "Sequence finished" };
                    match midi_file {
                        Some(path) => println!("{label}: {}", path.display()),
                        None => println!("{label}"),
                    }
                }
                EngineUpdate::Error { message } => eprintln!("{message}"),
            }
        }
    });

    println!("Describe a phrase. Commands: :replay, :tempo <bpm>, :quit");
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match line.split_once(' ').unwrap_or((line, "")) {
            (":quit", _) => break,
            (":replay", _) => EngineCommand::Replay,
            (":tempo", bpm) => match bpm.trim().parse::<f64>() {
                Ok(bpm) => EngineCommand::SetTempo(bpm),
                Err(_) => {
                    eprintln!("usage: :tempo <bpm>");
                    continue;
                }
            },
            _ => EngineCommand::Generate {
                prompt: line.to_string(),
            },
        };

        if engine.command_tx.send(command).is_err() {
            break;
        }
    }

    engine.shutdown();
}
