use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vanish", about = "Vanish: notes that self-destruct", version)]
struct Cli {
    /// Vanish server URL (default: http://localhost:8080 or $VANISH_SERVER)
    #[arg(long, env = "VANISH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Session token from `register` or `login` ($VANISH_TOKEN)
    #[arg(long, env = "VANISH_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Vanish HTTP server
    Serve {
        /// Port to listen on (default: $VANISH_PORT or 8080)
        #[arg(long, env = "VANISH_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $VANISH_HOST or 0.0.0.0)
        #[arg(long, env = "VANISH_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Create an account and print a session token
    Register {
        username: String,
        #[arg(long, env = "VANISH_PASSWORD")]
        password: String,
    },
    /// Log in and print a session token
    Login {
        username: String,
        #[arg(long, env = "VANISH_PASSWORD")]
        password: String,
    },
    /// End the current session
    Logout,
    /// Create a note; content is read from stdin when omitted or `-`
    Create {
        #[arg(long)]
        title: String,
        content: Option<String>,
        /// Lifetime e.g. 1h, 30m, 7d (default: server's, 30 days)
        #[arg(long)]
        ttl: Option<String>,
        /// Views before the note self-destructs (default: 1)
        #[arg(long)]
        views: Option<u32>,
    },
    /// Read a note by id or share URL. This consumes a view.
    Get {
        /// Note id or full share URL
        note: String,
    },
    /// List your notes (metadata only)
    List,
    /// Print the shareable URL for a note id
    Share { id: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VANISH_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_owned();

    match cli.command {
        Commands::Serve { port, host } => {
            let cfg = vanish_server::ServerConfig {
                host,
                port,
                ..Default::default()
            };
            vanish_server::run(cfg).await
        }

        Commands::Register { username, password } => {
            let token = session_request(&server, "register", &username, &password).await?;
            println!("✓ registered {username}");
            println!("export VANISH_TOKEN={token}");
            Ok(())
        }

        Commands::Login { username, password } => {
            let token = session_request(&server, "login", &username, &password).await?;
            println!("export VANISH_TOKEN={token}");
            Ok(())
        }

        Commands::Logout => {
            let token = require_token(&cli.token)?;
            cmd_logout(&server, &token).await
        }

        Commands::Create {
            title,
            content,
            ttl,
            views,
        } => {
            let token = require_token(&cli.token)?;
            let content = match content.as_deref() {
                None | Some("-") => read_stdin()?,
                Some(c) => c.to_owned(),
            };
            let ttl_seconds = ttl.as_deref().map(parse_duration).transpose()?;
            let note = create_note(&server, &token, &title, &content, ttl_seconds, views).await?;
            println!("{}{}", server, note["url"].as_str().unwrap_or_default());
            Ok(())
        }

        Commands::Get { note } => {
            let note = fetch_note(&server, note_id(&note)).await?;
            println!("{}", note["content"].as_str().unwrap_or_default());
            if note["consumed"].as_bool().unwrap_or(false) {
                eprintln!("(this was the last view; the note is gone)");
            }
            Ok(())
        }

        Commands::List => {
            let token = require_token(&cli.token)?;
            cmd_list(&server, &token).await
        }

        Commands::Share { id } => {
            println!("{}/notes/{}", server, id);
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn session_request(server: &str, action: &str, username: &str, password: &str) -> Result<String> {
    let resp = Client::new()
        .post(format!("{server}/users/{action}"))
        .json(&json!({"username": username, "password": password}))
        .send()
        .await
        .context("HTTP request failed")?;

    let json = expect_success(resp).await?;
    json["token"]
        .as_str()
        .map(str::to_owned)
        .context("server response has no token")
}

async fn cmd_logout(server: &str, token: &str) -> Result<()> {
    let resp = Client::new()
        .post(format!("{server}/users/logout"))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;
    expect_success(resp).await?;
    println!("✓ logged out");
    Ok(())
}

async fn create_note(
    server: &str,
    token: &str,
    title: &str,
    content: &str,
    ttl_seconds: Option<u64>,
    max_views: Option<u32>,
) -> Result<Value> {
    let body = json!({
        "title": title,
        "content": content,
        "ttl_seconds": ttl_seconds,
        "max_views": max_views,
    });

    let resp = Client::new()
        .post(format!("{server}/notes"))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    expect_success(resp).await
}

async fn fetch_note(server: &str, id: &str) -> Result<Value> {
    let resp = Client::new()
        .get(format!("{server}/notes/{id}"))
        .send()
        .await
        .context("HTTP request failed")?;
    expect_success(resp).await
}

async fn cmd_list(server: &str, token: &str) -> Result<()> {
    let resp = Client::new()
        .get(format!("{server}/notes"))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;

    let json = expect_success(resp).await?;
    let notes: Vec<NoteItem> =
        serde_json::from_value(json["notes"].clone()).context("parse notes list")?;

    if notes.is_empty() {
        println!("(no notes)");
        return Ok(());
    }
    let now = now();
    for n in &notes {
        println!(
            "  {}  {}  ({}, {}/{} views)",
            n.id,
            n.title,
            describe_expiry(n.expires_at, now),
            n.current_views,
            n.max_views
        );
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct NoteItem {
    id: String,
    title: String,
    expires_at: Option<i64>,
    current_views: u32,
    max_views: u32,
}

/// Parse the JSON body and turn non-2xx answers into errors carrying the
/// server's `error` message.
async fn expect_success(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if status.is_success() {
        return Ok(json);
    }
    match json["error"].as_str() {
        Some(msg) => anyhow::bail!("{msg} ({status})"),
        None => anyhow::bail!("server returned {status}"),
    }
}

fn require_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("--token / VANISH_TOKEN is required for this command; run `vanish login` first")
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read note content from stdin")?;
    Ok(buf)
}

/// Accept a bare id or a share URL such as `http://host/notes/<id>/`.
fn note_id(arg: &str) -> &str {
    arg.trim_end_matches('/').rsplit('/').next().unwrap_or(arg)
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn describe_expiry(expires_at: Option<i64>, now: i64) -> String {
    match expires_at {
        Some(exp) if exp >= now => format!("expires in {}", format_duration((exp - now) as u64)),
        Some(_) => "expired".to_string(),
        None => "no expiry".to_string(),
    }
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
