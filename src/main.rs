mod configuration;
mod controller;
mod error;
mod process;
mod process_log;
mod settings;
mod system;

#[cfg(all(test, unix))]
mod test_support;

use std::{
    io::{BufRead, Read},
    path::PathBuf,
    process::ExitCode,
    sync::mpsc,
    time::Duration,
};

use clap::{Parser, Subcommand};

use crate::{
    configuration::server_fields,
    controller::ProxyController,
    error::{ControlError, Result},
    settings::Settings,
};

#[derive(Parser)]
#[command(name = "v2ray-control", version, about = "Run v2ray and route the desktop through it")]
struct Cli {
    /// Settings file (default: <config dir>/v2ray-control/v2ray-control.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// v2ray JSON configuration to edit and launch with
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// v2ray executable
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    /// Local SOCKS listener the system proxy points at (host:port)
    #[arg(long, global = true)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective settings and the configured server
    Show,
    /// Edit the first outbound server in place
    Set {
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: String,
        #[arg(long)]
        protocol: String,
    },
    /// Replace the configuration with a JSON document (stdin when FILE is omitted)
    Import { file: Option<PathBuf> },
    /// Start v2ray, route the system through it, and stop on Enter
    Run,
    /// Set the system proxy back to direct
    Reset,
    /// Write the effective settings to the settings file
    Init,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("v2ray_control=info"),
    )
    .init();

    log::info!(
        "v2ray-control v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| "<default: info>".into()),
    );

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(Settings::settings_file_path);
    let mut settings = Settings::load(&settings_path)?;
    if let Some(config) = cli.config {
        settings.config_path = config;
    }
    if let Some(binary) = cli.binary {
        settings.binary_path = Some(binary);
    }
    if let Some(listen) = cli.listen {
        settings.listen_address = listen;
    }

    match cli.command {
        Command::Init => {
            settings.save(&settings_path)?;
            println!("Settings written to {}", settings_path.display());
            Ok(())
        }
        Command::Show => show(&settings, &settings_path),
        Command::Set {
            address,
            port,
            protocol,
        } => {
            let controller = ProxyController::from_settings(&settings)?;
            println!("{}", controller.save_field_edits(&address, &port, &protocol)?);
            Ok(())
        }
        Command::Import { file } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .map_err(|error| ControlError::io(path, error))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .map_err(|error| ControlError::io("<stdin>", error))?;
                    text
                }
            };
            let controller = ProxyController::from_settings(&settings)?;
            println!("{}", controller.import_from_text(&text)?);
            Ok(())
        }
        Command::Reset => {
            let mut controller = ProxyController::from_settings(&settings)?;
            println!("{}", controller.reset_system_proxy()?);
            Ok(())
        }
        Command::Run => run_session(&settings),
    }
}

fn show(settings: &Settings, settings_path: &std::path::Path) -> Result<()> {
    let controller = ProxyController::from_settings(settings)?;
    let (host, port) = controller.listen_endpoint();

    println!("settings:  {}", settings_path.display());
    println!("config:    {}", controller.config_path().display());
    match &settings.binary_path {
        Some(binary) => println!("binary:    {}", binary.display()),
        None => println!("binary:    <search PATH>"),
    }
    println!("listen:    {host}:{port}");

    let config = controller.load_config()?;
    let server = server_fields(&config)?;
    println!("address:   {}", server.address);
    match server.port {
        Some(port) => println!("port:      {port}"),
        None => println!("port:      <unset>"),
    }
    println!("protocol:  {}", server.protocol);
    Ok(())
}

fn run_session(settings: &Settings) -> Result<()> {
    let mut controller = ProxyController::from_settings(settings)?;

    let started = controller.start_session()?;
    println!("{}", started.message());
    let routed = started.is_routed();

    let (sender, receiver) = mpsc::channel();
    std::thread::spawn(move || {
        if stop_line_entered(std::io::stdin().lock()) {
            let _ = sender.send(());
        } else {
            log::info!("[session] stdin closed, running until v2ray exits");
        }
    });
    println!("Press Enter to stop (pid {}).", started.pid());

    loop {
        if let Some(exit) = controller.poll_exit() {
            println!("V2Ray exited on its own ({exit}).");
            if let Ok(log) = controller.process().log().lock() {
                for line in log.tail(5) {
                    println!("  {line}");
                }
            }
            if routed {
                println!("{}", controller.reset_system_proxy()?);
            }
            return Ok(());
        }
        match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }

    println!("{}", controller.stop_session()?);
    Ok(())
}

/// True once a line (Enter) arrives; false on EOF or a read error.
fn stop_line_entered(mut input: impl BufRead) -> bool {
    let mut line = String::new();
    matches!(input.read_line(&mut line), Ok(read) if read > 0)
}
