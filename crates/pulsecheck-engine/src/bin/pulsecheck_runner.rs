use std::fs;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value as Json;
use tracing_subscriber::EnvFilter;

use pulsecheck_engine::template::render;
use pulsecheck_engine::{CapabilityContext, EngineConfig, RunInput, render_summary, run_tests};

const LOG_ENV: &str = "PULSECHECK_LOG";

fn main() {
    init_logging();
    match run(std::env::args().skip(1).collect()) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(2);
        }
    }
}

/// Logs go to stderr so stdout carries only the report.
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// `Ok(false)` when the run completed but an assertion failed.
fn run(args: Vec<String>) -> Result<bool> {
    let Some(command) = args.first() else {
        bail!(usage());
    };

    match command.as_str() {
        "run" => run_assertions(&args[1..]),
        "render" => run_render(&args[1..]).map(|()| true),
        "help" | "--help" | "-h" => {
            println!("{}", usage());
            Ok(true)
        }
        other => bail!("unknown subcommand '{other}'\n\n{}", usage()),
    }
}

fn usage() -> String {
    [
        "pulsecheck_runner usage:",
        "  pulsecheck_runner run --input <path> [--config <path>] [--summary]",
        "  pulsecheck_runner render --template <path> --variables <path>",
        "",
        "Set PULSECHECK_LOG (e.g. `info`, `pulsecheck::script=debug`) for logs on stderr.",
    ]
    .join("\n")
}

fn flag_value<'a>(args: &'a [String], index: usize, flag: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{flag} requires a path"))
}

fn run_assertions(args: &[String]) -> Result<bool> {
    let mut input_path: Option<&str> = None;
    let mut config_path: Option<&str> = None;
    let mut summary = false;

    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--input" => {
                index += 1;
                input_path = Some(flag_value(args, index, "--input")?);
            }
            "--config" => {
                index += 1;
                config_path = Some(flag_value(args, index, "--config")?);
            }
            "--summary" => summary = true,
            flag => bail!("unknown flag for run: {flag}"),
        }
        index += 1;
    }

    let input_path = input_path.ok_or_else(|| anyhow!("missing required --input <path>"))?;
    let input = RunInput::from_file(input_path)
        .with_context(|| format!("loading run input from {input_path}"))?;
    let config = match config_path {
        Some(path) => {
            EngineConfig::from_file(path).with_context(|| format!("loading config from {path}"))?
        }
        None => EngineConfig::default(),
    };

    let report = run_tests(&input, &config);
    if summary {
        println!("{}", render_summary(&report));
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("encoding run report")?
        );
    }
    Ok(report.all_tests_passed)
}

fn run_render(args: &[String]) -> Result<()> {
    let mut template_path: Option<&str> = None;
    let mut variables_path: Option<&str> = None;

    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--template" => {
                index += 1;
                template_path = Some(flag_value(args, index, "--template")?);
            }
            "--variables" => {
                index += 1;
                variables_path = Some(flag_value(args, index, "--variables")?);
            }
            flag => bail!("unknown flag for render: {flag}"),
        }
        index += 1;
    }

    let template_path =
        template_path.ok_or_else(|| anyhow!("missing required --template <path>"))?;
    let variables_path =
        variables_path.ok_or_else(|| anyhow!("missing required --variables <path>"))?;

    let template = load_json(template_path)?;
    let variables = CapabilityContext::from_initial_variables(&load_json(variables_path)?)
        .with_context(|| format!("reading variables from {variables_path}"))?;
    let rendered = render(&template, variables.variables());
    println!(
        "{}",
        serde_json::to_string_pretty(&rendered).context("encoding rendered template")?
    );
    Ok(())
}

fn load_json(path: &str) -> Result<Json> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {path} as JSON"))
}
