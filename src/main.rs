use std::path::PathBuf;

use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod db;
mod handlers;
mod llm;
mod metrics;
mod pipeline;
mod state;
mod utils;

use config::CONFIG;
use handlers::commands::{self, RevealArgs};
use pipeline::{RevealMode, RevealSettings};
use state::AppState;
use utils::logging::init_logging;

#[derive(Debug)]
enum Command {
    Analyze { image: PathBuf },
    Reveal { args: RevealArgs, ephemeral: bool },
    Stats,
    ExportMetrics { out: Option<PathBuf> },
    ClearMetrics,
}

fn usage() -> &'static str {
    "Usage:\n  \
     darkroom analyze --image <path>\n  \
     darkroom reveal --image <path> [--prompt <text>] [--strength <0..1>] [--resolution <1K|2K|4K>] \
     [--aspect <ratio>] [--custom <text>] [--no-validate] [--no-retry] [--low-cost] [--out <path>] [--ephemeral]\n  \
     darkroom stats\n  \
     darkroom export-metrics [--out <path>]\n  \
     darkroom clear-metrics"
}

fn take_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str> {
    *index += 1;
    args.get(*index)
        .map(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing value for {flag}"))
}

fn parse_strength(value: &str) -> Result<f64> {
    let strength = value
        .parse::<f64>()
        .map_err(|_| anyhow!("Invalid --strength value: {value}"))?;
    if !(0.0..=1.0).contains(&strength) {
        return Err(anyhow!("--strength must be between 0 and 1, got {value}"));
    }
    Ok(strength)
}

fn parse_analyze_args(args: &[String]) -> Result<Command> {
    let mut image = None;
    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--image" => image = Some(PathBuf::from(take_value(args, &mut index, "--image")?)),
            "--help" | "-h" => return Err(anyhow!(usage())),
            other => return Err(anyhow!("Unknown analyze argument: {other}\n{}", usage())),
        }
        index += 1;
    }
    let image = image.ok_or_else(|| anyhow!("--image is required"))?;
    Ok(Command::Analyze { image })
}

fn parse_reveal_args(args: &[String]) -> Result<Command> {
    let mut image = None;
    let mut prompt = None;
    let mut settings = RevealSettings::default();
    let mut mode = RevealMode::Standard;
    let mut out = None;
    let mut ephemeral = false;

    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--image" => image = Some(PathBuf::from(take_value(args, &mut index, "--image")?)),
            "--prompt" => prompt = Some(take_value(args, &mut index, "--prompt")?.to_string()),
            "--strength" => {
                settings.strength = parse_strength(take_value(args, &mut index, "--strength")?)?
            }
            "--resolution" => {
                settings.resolution = take_value(args, &mut index, "--resolution")?.to_string()
            }
            "--aspect" => {
                settings.aspect_ratio = take_value(args, &mut index, "--aspect")?.to_string()
            }
            "--custom" => {
                settings.custom_prompt = take_value(args, &mut index, "--custom")?.to_string()
            }
            "--out" => out = Some(PathBuf::from(take_value(args, &mut index, "--out")?)),
            "--no-validate" => settings.validate_output = false,
            "--no-retry" => settings.enable_retry = false,
            "--low-cost" => mode = RevealMode::LowCost,
            "--ephemeral" => ephemeral = true,
            "--help" | "-h" => return Err(anyhow!(usage())),
            other => return Err(anyhow!("Unknown reveal argument: {other}\n{}", usage())),
        }
        index += 1;
    }

    let image = image.ok_or_else(|| anyhow!("--image is required"))?;
    Ok(Command::Reveal {
        args: RevealArgs {
            image,
            prompt,
            settings,
            mode,
            out,
        },
        ephemeral,
    })
}

fn parse_export_args(args: &[String]) -> Result<Command> {
    let mut out = None;
    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--out" => out = Some(PathBuf::from(take_value(args, &mut index, "--out")?)),
            "--help" | "-h" => return Err(anyhow!(usage())),
            other => {
                return Err(anyhow!(
                    "Unknown export-metrics argument: {other}\n{}",
                    usage()
                ))
            }
        }
        index += 1;
    }
    Ok(Command::ExportMetrics { out })
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args.get(1).map(|value| value.as_str()) {
        Some("analyze") => parse_analyze_args(args),
        Some("reveal") => parse_reveal_args(args),
        Some("stats") => Ok(Command::Stats),
        Some("export-metrics") => parse_export_args(args),
        Some("clear-metrics") => Ok(Command::ClearMetrics),
        Some(other) => Err(anyhow!("Unknown command: {other}\n{}", usage())),
        None => Err(anyhow!(usage())),
    }
}

fn require_api_key() -> Result<()> {
    if CONFIG.gemini_api_key.is_empty() {
        return Err(anyhow!("GEMINI_API_KEY is required for this command"));
    }
    Ok(())
}

/// Cancels `token` on Ctrl-C. The running attempt finishes; no new one starts.
fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current attempt");
            token.cancel();
        }
    })
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Analyze { image } => {
            require_api_key()?;
            let state = AppState::init(&CONFIG, true).await?;
            println!("{}", commands::analyze_handler(&state, &image).await?);
        }
        Command::Reveal { args, ephemeral } => {
            require_api_key()?;
            let state = AppState::init(&CONFIG, ephemeral).await?;
            let cancel = CancellationToken::new();
            let watcher = cancel_on_ctrl_c(cancel.clone());
            let outcome = commands::reveal_handler(&state, &args, cancel).await;
            watcher.abort();
            let summary = outcome?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Stats => {
            let state = AppState::init(&CONFIG, false).await?;
            println!("{}", commands::stats_handler(&state).await?);
        }
        Command::ExportMetrics { out } => {
            let state = AppState::init(&CONFIG, false).await?;
            println!(
                "{}",
                commands::export_metrics_handler(&state, out.as_deref()).await?
            );
        }
        Command::ClearMetrics => {
            let state = AppState::init(&CONFIG, false).await?;
            println!("{}", commands::clear_metrics_handler(&state).await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _guards = init_logging(&CONFIG.log_level);

    let args: Vec<String> = std::env::args().collect();
    let command = parse_command(&args)?;
    info!("Starting portrait darkroom: {:?}", command);

    if let Err(err) = run(command).await {
        error!("Command failed: {err:#}");
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(values: &[&str]) -> Vec<String> {
        std::iter::once("darkroom")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn reveal_flags_map_onto_settings() {
        let command = parse_command(&argv(&[
            "reveal",
            "--image",
            "me.jpg",
            "--strength",
            "0.8",
            "--aspect",
            "3:4",
            "--no-retry",
            "--low-cost",
            "--ephemeral",
        ]))
        .unwrap();
        let Command::Reveal { args, ephemeral } = command else {
            panic!("expected reveal command");
        };
        assert!(ephemeral);
        assert_eq!(args.image, PathBuf::from("me.jpg"));
        assert_eq!(args.settings.strength, 0.8);
        assert_eq!(args.settings.aspect_ratio, "3:4");
        assert!(!args.settings.enable_retry);
        assert!(args.settings.validate_output);
        assert_eq!(args.mode, RevealMode::LowCost);
    }

    #[test]
    fn reveal_requires_image_and_valid_strength() {
        assert!(parse_command(&argv(&["reveal"])).is_err());
        let err = parse_command(&argv(&["reveal", "--image", "a.png", "--strength", "1.5"]))
            .unwrap_err();
        assert!(err.to_string().contains("between 0 and 1"));
        assert!(parse_command(&argv(&["reveal", "--image"])).is_err());
    }

    #[test]
    fn metric_commands_parse() {
        assert!(matches!(parse_command(&argv(&["stats"])).unwrap(), Command::Stats));
        assert!(matches!(
            parse_command(&argv(&["clear-metrics"])).unwrap(),
            Command::ClearMetrics
        ));
        let Command::ExportMetrics { out } =
            parse_command(&argv(&["export-metrics", "--out", "m.json"])).unwrap()
        else {
            panic!("expected export command");
        };
        assert_eq!(out, Some(PathBuf::from("m.json")));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(parse_command(&argv(&["paint"])).is_err());
        assert!(parse_command(&argv(&[])).is_err());
        assert!(parse_command(&argv(&["analyze", "--bogus"])).is_err());
    }
}
