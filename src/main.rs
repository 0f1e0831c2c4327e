//! Ansible CLI - gateway server and test client.

use clap::Parser;
use colored::Colorize;
use tokio::signal;
use tokio::sync::mpsc;

use ansible::cli::*;
use ansible::client::{AnsibleClient, ClientEvent};
use ansible::config::{init_logging, Config};
use ansible::error::{Error, Result};
use ansible::server::{AnsibleServer, ServerEvent};
use ansible::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_config = ansible::config::LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..Default::default()
    };
    init_logging(&log_config)?;

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    // Dispatch command
    match cli.command {
        Commands::Server(args) => run_server(args, config).await,
        Commands::Client(args) => run_client(args, config).await,
        Commands::Commands => run_commands(&config),
        Commands::Config(args) => run_config(args),
    }
}

fn print_banner(title: &str) {
    println!(
        "{}",
        "╔══════════════════════════════════════════╗".bright_cyan()
    );
    println!("{}", format!("║     {title:<37}║").bright_cyan());
    println!(
        "{}",
        format!("║     Version {VERSION:<29}║").bright_cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════╝".bright_cyan()
    );
    println!();
}

/// Run the gateway server
async fn run_server(args: ServerArgs, mut config: Config) -> Result<()> {
    print_banner("ANSIBLE SERVER");

    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(protocol) = args.protocol {
        config.server.protocol = protocol;
    }
    if let Some(timeout) = args.heartbeat_timeout {
        config.server.heartbeat_timeout = timeout;
    }
    config.validate()?;

    let (server, mut events) = AnsibleServer::bind(&config).await?;
    let handle = server.handle();

    println!("{}", "Listening on:".bright_white());
    println!(
        "  {} {} ({})",
        "→".cyan(),
        server.local_addr()?,
        config.server.protocol
    );
    println!();

    let mut task = tokio::spawn(server.run());
    println!("{} Server running. Press Ctrl+C to stop.", "●".green());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_server_event(event, args.fill),
                None => break,
            },
            _ = signal::ctrl_c() => {
                handle.shutdown()?;
                break;
            }
            result = &mut task => {
                return result.map_err(|e| Error::Internal(e.to_string()))?;
            }
        }
    }

    task.await.map_err(|e| Error::Internal(e.to_string()))??;

    println!();
    println!("{} Server stopped.", "●".yellow());
    Ok(())
}

fn print_server_event(event: ServerEvent, fill: u8) {
    match event {
        ServerEvent::DataRequired(request) => {
            let width = request
                .command
                .return_type
                .and_then(|ty| ty.width())
                .unwrap_or(1);
            println!(
                "  {} {} {} from {}",
                "?".bright_yellow(),
                request.command,
                request.params,
                request.peer
            );
            request.respond(vec![fill; width]);
        }
        ServerEvent::CommandReceived {
            peer,
            command,
            params,
        } => {
            println!("  {} {} {} from {}", "←".cyan(), command, params, peer);
        }
        ServerEvent::StateChanged { peer, from, to } => {
            println!("  {} {} {} -> {}", "●".green(), peer, from, to);
        }
        ServerEvent::ConnectionClosed { peer, reason } => {
            println!("  {} {} closed ({})", "●".yellow(), peer, reason);
        }
        ServerEvent::Error { peer, error } => match peer {
            Some(peer) => println!("  {} {}: {}", "✗".red(), peer, error),
            None => println!("  {} {}", "✗".red(), error),
        },
    }
}

/// Connect to a gateway and run the requested calls
async fn run_client(args: ClientArgs, mut config: Config) -> Result<()> {
    print_banner("ANSIBLE CLIENT");

    if let Some(server) = args.server {
        config.client.server_addr = server;
    }
    if let Some(protocol) = args.protocol {
        config.client.protocol = protocol;
    }

    let (client, events) = AnsibleClient::connect(&config).await?;
    println!(
        "{} Connected to {} as {}",
        "✓".green(),
        client.server_addr(),
        client.state().to_string().bright_white()
    );

    let printer = tokio::spawn(print_client_events(events));

    for call in &args.calls {
        match client.request(&call.function, &call.args).await {
            Ok(Some(value)) => println!("  {} {} = {}", "→".cyan(), call, value),
            Ok(None) => println!("  {} {} ok", "→".cyan(), call),
            Err(e) => println!("  {} {} failed: {}", "✗".red(), call, e),
        }
    }

    if args.watch {
        println!("{} Watching for events. Press Ctrl+C to stop.", "●".green());
        let _ = signal::ctrl_c().await;
    }

    if client.is_connected() {
        client.close().await?;
    }
    drop(client);
    let _ = printer.await;

    Ok(())
}

async fn print_client_events(mut events: mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::StateChanged { old, new } => {
                println!("  {} state {} -> {}", "●".green(), old, new);
            }
            ClientEvent::Disconnected { code, reason } => {
                println!("  {} disconnected ({}, code {})", "●".yellow(), reason, code);
                break;
            }
            ClientEvent::AsyncEvent { id_code, name, data } => {
                println!(
                    "  {} {} ({:#04x}) {:02x?}",
                    "←".cyan(),
                    name.bright_white(),
                    id_code,
                    data
                );
            }
            ClientEvent::Error(e) => println!("  {} {}", "✗".red(), e),
        }
    }
}

/// List the configured command table
fn run_commands(config: &Config) -> Result<()> {
    let table = config.command_table()?;

    println!("{}", "Commands:".bright_white().bold());
    println!("{}", "─".repeat(50));
    for command in table.commands() {
        let function = command.function_name.as_deref().unwrap_or("-");
        let returns = command
            .return_type
            .map_or_else(|| "-".to_string(), |ty| ty.to_string());
        let marker = if command.data_required { "*" } else { " " };
        println!(
            "  {:>3}/{:<3} {}{:<24} {:<16} -> {}",
            command.did,
            command.cid,
            marker.bright_yellow(),
            command.full_name(),
            function,
            returns
        );
        for param in &command.params {
            println!(
                "            {} {} @{}+{}",
                param.name.dimmed(),
                param.ty,
                param.offset,
                param.length
            );
        }
    }

    let events = table.async_events();
    if !events.is_empty() {
        println!();
        println!("{}", "Async events:".bright_white().bold());
        println!("{}", "─".repeat(50));
        for (id_code, name) in events {
            println!("  {id_code:#04x} {name}");
        }
    }

    Ok(())
}

/// Print or write an example configuration
fn run_config(args: ConfigArgs) -> Result<()> {
    let config = Config::example();

    let output = if args.server {
        toml::to_string_pretty(&config.server)
    } else if args.client {
        toml::to_string_pretty(&config.client)
    } else {
        toml::to_string_pretty(&config)
    }
    .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{output}");
    }

    Ok(())
}
