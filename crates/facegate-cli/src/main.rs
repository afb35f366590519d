use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod models;

#[zbus::proxy(
    interface = "org.freedesktop.Facegate1",
    default_service = "org.freedesktop.Facegate1",
    default_path = "/org/freedesktop/Facegate1"
)]
trait Facegate {
    async fn enroll(&self, name: &str, image: &[u8]) -> zbus::Result<String>;
    async fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    async fn submit_liveness(
        &self,
        session_token: &str,
        user_id: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::Result<String>;
    async fn track_frame(&self, stream_id: &str, image: &[u8]) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from an image file
    Enroll {
        /// Display name for the identity
        #[arg(short, long)]
        name: String,
        image: PathBuf,
    },
    /// Recognize the face in an image and open a verification session
    Recognize { image: PathBuf },
    /// Submit a sequence of frames for blink liveness
    Liveness {
        /// Session token returned by `recognize`
        #[arg(short, long)]
        token: String,
        /// User id returned by `recognize`
        #[arg(short, long)]
        user: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize from the first frame, then run liveness over all frames
    Verify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Feed frames of one stream to the multi-face tracker
    Track {
        /// Stream identifier; frames with the same id share tracks
        #[arg(short, long, default_value = "cli")]
        stream: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show daemon status
    Status,
    /// Check the model files in the model directory
    Models {
        /// Model directory (default: $XDG_DATA_HOME/facegate/models)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_images(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths.iter().map(|p| read_image(p)).collect()
}

/// Pretty-print a daemon reply. Returns whether it reported success.
fn print_reply(reply: &str) -> Result<bool> {
    let value: Value = serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(value["status"] != "failed")
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn connect(session: bool) -> Result<FacegateProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    FacegateProxy::new(&conn)
        .await
        .context("facegated is not reachable")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Models { dir } = &cli.command {
        let dir = dir.clone().unwrap_or_else(facegate_vision::default_model_dir);
        return Ok(exit_code(models::check(&dir)?));
    }

    let proxy = connect(cli.session).await?;

    let ok = match cli.command {
        Commands::Enroll { name, image } => {
            let bytes = read_image(&image)?;
            print_reply(&proxy.enroll(&name, &bytes).await?)?
        }
        Commands::Recognize { image } => {
            let bytes = read_image(&image)?;
            print_reply(&proxy.recognize(&bytes).await?)?
        }
        Commands::Liveness {
            token,
            user,
            images,
        } => {
            let frames = read_images(&images)?;
            print_reply(&proxy.submit_liveness(&token, &user, frames).await?)?
        }
        Commands::Verify { images } => {
            let frames = read_images(&images)?;
            let reply: Value = serde_json::from_str(&proxy.recognize(&frames[0]).await?)?;
            if reply["status"] != "success" {
                println!("{}", serde_json::to_string_pretty(&reply)?);
                return Ok(ExitCode::FAILURE);
            }
            let token = reply["session_token"].as_str().unwrap_or_default();
            let user = reply["user_id"].as_str().unwrap_or_default();
            tracing::debug!(user, name = %reply["name"], "recognized; submitting liveness");
            print_reply(&proxy.submit_liveness(token, user, frames).await?)?
        }
        Commands::Track { stream, images } => {
            let mut ok = true;
            for path in &images {
                let bytes = read_image(path)?;
                ok &= print_reply(&proxy.track_frame(&stream, &bytes).await?)?;
            }
            ok
        }
        Commands::List => {
            let reply = proxy.list_identities().await?;
            let identities: Value = serde_json::from_str(&reply)?;
            match identities.as_array() {
                Some(list) if list.is_empty() => println!("No identities enrolled"),
                _ => println!("{}", serde_json::to_string_pretty(&identities)?),
            }
            true
        }
        Commands::Remove { id } => {
            let removed = proxy.remove_identity(&id).await?;
            if removed {
                println!("Removed identity {id}");
            } else {
                println!("No identity with id {id}");
            }
            removed
        }
        Commands::Status => print_reply(&proxy.status().await?)?,
        Commands::Models { .. } => unreachable!("handled before connecting"),
    };

    Ok(exit_code(ok))
}
