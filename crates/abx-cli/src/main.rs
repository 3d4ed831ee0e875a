//! abx CLI
//!
//! Small shell around the blocker facade: run one-off filter checks against
//! a script payload, serve the local command channel, or send commands to a
//! running instance.

use std::fs;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use abx_host::AdBlocker;
use abx_ipc::{default_socket_path, CommandClient, CommandRequest, CommandServer};

#[derive(Parser)]
#[command(name = "abx-cli")]
#[command(about = "abx ad blocker shell and command client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check one URL against the filter payload
    Check {
        /// Script payload file
        #[arg(short, long)]
        script: String,

        /// URL to check
        url: String,

        /// Content type of the request (script, image, document, ...)
        #[arg(short = 't', long, default_value = "document")]
        content_type: String,

        /// URL of the document issuing the request
        #[arg(short, long, default_value = "")]
        parent: String,
    },

    /// Print element-hiding selectors for a domain
    Selectors {
        /// Script payload file
        #[arg(short, long)]
        script: String,

        /// Domain to query
        domain: String,
    },

    /// Print the element-hiding stylesheet
    Css {
        /// Script payload file
        #[arg(short, long)]
        script: String,
    },

    /// Run a blocker instance and serve the command channel until stdin
    /// closes
    Serve {
        /// Script payload file
        #[arg(short, long)]
        script: String,

        /// Command socket path
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Send one command to a running instance
    Send {
        /// Command to send
        #[arg(value_enum)]
        command: CommandName,

        /// Domain for exception commands
        #[arg(short, long, default_value = "")]
        domain: String,

        /// Command socket path
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CommandName {
    Enable,
    Disable,
    AddException,
    RemoveException,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check {
            script,
            url,
            content_type,
            parent,
        } => cmd_check(&script, &url, &content_type, &parent),
        Commands::Selectors { script, domain } => cmd_selectors(&script, &domain),
        Commands::Css { script } => cmd_css(&script),
        Commands::Serve { script, socket } => cmd_serve(&script, socket),
        Commands::Send {
            command,
            domain,
            socket,
        } => cmd_send(command, &domain, socket),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_blocker(script_path: &str) -> Result<AdBlocker, String> {
    let script = fs::read_to_string(script_path)
        .map_err(|e| format!("Failed to read '{script_path}': {e}"))?;
    abx_host::create_instance(&script)
        .ok_or_else(|| format!("Failed to bring up the payload from '{script_path}'"))
}

fn cmd_check(script: &str, url: &str, content_type: &str, parent: &str) -> Result<(), String> {
    let blocker = load_blocker(script)?;
    let result = blocker.check_filter_match(url, content_type, parent);
    println!("{} collapse={}", result.kind.as_str(), result.collapse);
    blocker.dispose();
    Ok(())
}

fn cmd_selectors(script: &str, domain: &str) -> Result<(), String> {
    let blocker = load_blocker(script)?;
    for selector in blocker.element_hiding_selectors(domain) {
        println!("{selector}");
    }
    blocker.dispose();
    Ok(())
}

fn cmd_css(script: &str) -> Result<(), String> {
    let blocker = load_blocker(script)?;
    println!("{}", blocker.generate_css_content());
    blocker.dispose();
    Ok(())
}

fn cmd_serve(script: &str, socket: Option<PathBuf>) -> Result<(), String> {
    let socket = socket.unwrap_or_else(default_socket_path);
    let blocker = Arc::new(load_blocker(script)?);
    let server = CommandServer::start(&socket, blocker.clone())
        .map_err(|e| format!("Failed to bind command socket: {e}"))?;
    println!(
        "Serving commands on {} (first run: {}); press Enter to quit",
        socket.display(),
        blocker.is_first_run()
    );

    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    server.stop();
    Ok(())
}

fn cmd_send(command: CommandName, domain: &str, socket: Option<PathBuf>) -> Result<(), String> {
    let request = match command {
        CommandName::Enable => CommandRequest::enable(),
        CommandName::Disable => CommandRequest::disable(),
        CommandName::AddException | CommandName::RemoveException if domain.is_empty() => {
            return Err("Exception commands need --domain".to_string());
        }
        CommandName::AddException => CommandRequest::add_exception(domain),
        CommandName::RemoveException => CommandRequest::remove_exception(domain),
    };
    let client = match socket {
        Some(path) => CommandClient::to(path),
        None => CommandClient::new(),
    };
    client
        .send(&request)
        .map_err(|e| format!("Failed to send command: {e}"))
}
