//! Kinderhub CLI - sign in to the marketplace and inspect the local session
//!
//! Every invocation opens one view on the configured session storage, so a
//! sign-in from one shell is visible to the next.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use kinderhub_core::{
    init_logging, log_operation_error, performance, with_timeout, Credentials, KinderhubConfig,
    Registration, Role, StorageKind, UserProfile,
};
use kinderhub_session::{
    FileBackend, HttpSessionAuthority, MemoryBackend, SessionAuthority, SessionError, SessionPhase,
    SessionView, StorageBackend,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Environment variable overriding `api.base_url`
const API_URL_ENV: &str = "KINDERHUB_API_URL";

#[derive(Parser)]
#[command(name = "kinderhub")]
#[command(about = "Sign in to Kinderhub and manage the local session")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        #[arg(short, long)]
        email: String,

        /// Read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Create an account and sign in
    Register {
        #[arg(short, long)]
        email: String,

        /// Read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,

        #[arg(long)]
        first_name: Option<String>,

        #[arg(long)]
        last_name: Option<String>,

        #[arg(long)]
        phone: Option<String>,

        /// Account role (user, provider, teacher)
        #[arg(long, default_value = "user")]
        role: Role,
    },

    /// Sign out locally and on the server
    Logout,

    /// Revalidate the session and show the signed-in user
    Whoami {
        /// Print the profile as JSON
        #[arg(long)]
        json: bool,
    },

    /// Exchange the refresh token for new tokens
    Refresh,

    /// Show the stored session without contacting the server
    Status,

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Validate current configuration
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `config --init` must work before any config file exists
    let mut config = match cli.command {
        Commands::Config { init: true, .. } => KinderhubConfig::default(),
        _ => load_config(cli.config.as_ref())?,
    };
    if let Ok(url) = std::env::var(API_URL_ENV) {
        config.api.base_url = url;
    }

    let mut logging_config = config.logging.clone();
    if cli.verbose {
        logging_config.level = "debug".to_string();
    }
    init_logging(&logging_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting Kinderhub CLI v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Config {
            show,
            init,
            validate,
        } => handle_config(&config, cli.config, show, init, validate),
        Commands::Login { email, password } => {
            let view = open_view(&config)?;
            handle_login(&view, email, password).await
        }
        Commands::Register {
            email,
            password,
            first_name,
            last_name,
            phone,
            role,
        } => {
            let view = open_view(&config)?;
            let registration = Registration {
                email,
                password: password_or_stdin(password)?,
                first_name,
                last_name,
                phone,
                role,
            };
            handle_register(&view, registration).await
        }
        Commands::Logout => {
            let view = open_view(&config)?;
            // Local state is cleared before the remote call starts
            let limit_ms = config.api.timeout_seconds * 1000;
            if let Err(e) = with_timeout(view.accessor.logout(), limit_ms, "logout").await {
                warn!("Server did not confirm logout: {}", e);
            }
            println!("👋 Signed out");
            Ok(())
        }
        Commands::Whoami { json } => {
            let view = open_view(&config)?;
            handle_whoami(&view, json).await
        }
        Commands::Refresh => {
            let view = open_view(&config)?;
            match view.accessor.refresh_tokens().await {
                SessionPhase::Authenticated => {
                    println!("🔄 Session tokens refreshed");
                    Ok(())
                }
                _ => bail!("Session could not be refreshed; please log in again"),
            }
        }
        Commands::Status => {
            let view = open_view(&config)?;
            handle_status(&view);
            Ok(())
        }
    }
}

fn load_config(config_path: Option<&PathBuf>) -> anyhow::Result<KinderhubConfig> {
    if let Some(path) = config_path {
        return KinderhubConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()));
    }

    // Try to load from default locations
    let default_paths = [
        Some(KinderhubConfig::default_path()),
        dirs::home_dir().map(|d| d.join(".kinderhub").join("config.toml")),
        Some(PathBuf::from("kinderhub.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            return KinderhubConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()));
        }
    }

    Ok(KinderhubConfig::default())
}

fn open_view(config: &KinderhubConfig) -> anyhow::Result<SessionView> {
    config.validate()?;

    let backend: Arc<dyn StorageBackend> = match config.storage.kind {
        StorageKind::File => Arc::new(FileBackend::new(config.storage.resolved_dir())?),
        StorageKind::Memory => {
            warn!("Memory storage selected; the session ends with this process");
            Arc::new(MemoryBackend::new())
        }
    };
    let authority: Arc<dyn SessionAuthority> = Arc::new(HttpSessionAuthority::new(&config.api)?);

    Ok(SessionView::open(
        backend,
        authority,
        config.session.refresh.clone(),
    ))
}

fn password_or_stdin(password: Option<String>) -> anyhow::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn handle_login(
    view: &SessionView,
    email: String,
    password: Option<String>,
) -> anyhow::Result<()> {
    let credentials = Credentials {
        email,
        password: password_or_stdin(password)?,
    };

    let user = match view.accessor.sign_in(&credentials).await {
        Ok(user) => user,
        Err(SessionError::Core(e)) if e.is_auth_failure() => {
            log_operation_error!("login", e, email = %credentials.email);
            bail!("Wrong email or password for {}", credentials.email);
        }
        Err(e) => {
            log_operation_error!("login", e, email = %credentials.email);
            return Err(e.into());
        }
    };

    println!("✅ Signed in as {} ({})", user.display_name(), user.role);
    Ok(())
}

async fn handle_register(view: &SessionView, registration: Registration) -> anyhow::Result<()> {
    if registration.role == Role::Admin {
        bail!("Admin accounts cannot be self-registered");
    }

    let user = view.accessor.sign_up(&registration).await?;
    println!("✅ Account created for {} ({})", user.email, user.role);
    Ok(())
}

async fn handle_whoami(view: &SessionView, json: bool) -> anyhow::Result<()> {
    let phase = performance::measure_async("whoami", view.accessor.refresh_profile()).await;
    if phase != SessionPhase::Authenticated {
        println!("Not signed in");
        return Ok(());
    }

    let Some(user) = view.accessor.current_user() else {
        println!("Not signed in");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        print_profile(&user);
    }
    Ok(())
}

fn print_profile(user: &UserProfile) {
    println!("👤 {}", user.display_name());
    println!("   id:     {}", user.id);
    println!("   email:  {}", user.email);
    println!("   role:   {}", user.role);
    println!("   status: {:?}", user.status);

    let sections: Vec<String> = user
        .visible_sections()
        .iter()
        .map(|section| format!("{:?}", section).to_lowercase())
        .collect();
    println!("   dashboard: {}", sections.join(", "));
}

fn handle_status(view: &SessionView) {
    view.accessor.sync();
    let state = view.accessor.state();

    println!("📋 Session status");
    println!("   phase:   {}", state.phase);
    println!("   storage: {}", view.store.backend_name());
    if let Some(user) = state.user() {
        println!("   user:    {} <{}>", user.display_name(), user.email);
    }
    if let Some(expires_at) = state.expires_at() {
        println!("   expires: {}", expires_at.to_rfc3339());
    }
}

fn handle_config(
    config: &KinderhubConfig,
    config_path: Option<PathBuf>,
    show: bool,
    init: bool,
    validate: bool,
) -> anyhow::Result<()> {
    if init {
        let path = config_path.unwrap_or_else(KinderhubConfig::default_path);
        if path.exists() {
            bail!("Configuration already exists at {}", path.display());
        }
        KinderhubConfig::default().save_to_file(&path)?;
        println!("✅ Configuration initialized at: {}", path.display());
    }

    if show {
        println!("📋 Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    if validate {
        match config.validate() {
            Ok(()) => println!("✅ Configuration is valid"),
            Err(e) => bail!("Configuration is invalid: {}", e),
        }
    }

    if !(init || show || validate) {
        println!("Nothing to do; pass --show, --init or --validate");
    }

    Ok(())
}
