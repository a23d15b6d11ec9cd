use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use serde_json::Value;

use flagswitch::{
    BackendClient, ChoicePrompt, Error, FileChoiceStore, FlagSession, FrontendFlags,
    ProviderDescriptor, ProviderSelector, Registry, Result, Settings,
};

/// Pick a feature-flag provider and evaluate the demo flags through it.
#[derive(Debug, Parser)]
#[command(name = "flagswitch", version, about)]
struct Args {
    /// File the provider choice is persisted in.
    #[arg(long, env = "FLAGSWITCH_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Base URL or directory of the flag documents.
    #[arg(long, env = "FLAG_DOCUMENTS_URL")]
    documents: Option<String>,

    /// Backend base URL.
    #[arg(long, env = "BACKEND_URL")]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Choose a provider if needed, then read flags for each user id entered on stdin.
    Run {
        /// Users to refresh for before reading stdin.
        #[arg(long = "user")]
        users: Vec<String>,
    },
    /// Forget the persisted provider choice.
    Switch,
    /// List the registered providers.
    Providers,
    /// Call the backend's hello endpoint.
    Hello {
        /// User id to send.
        #[arg(long, default_value = "anonymous")]
        user: String,
    },
    /// Call the backend's flag-gated secret endpoint.
    Secret {
        /// User id to send.
        #[arg(long, default_value = "anonymous")]
        user: String,
    },
}

/// Asks for a provider on stdin.
struct StdinPrompt;

impl ChoicePrompt for StdinPrompt {
    fn choose(&mut self, options: &[&ProviderDescriptor]) -> Result<Option<String>> {
        if options.is_empty() {
            return Ok(None);
        }
        let mut stdout = io::stdout();
        writeln!(stdout, "Choose a feature flag provider:")?;
        for (index, descriptor) in options.iter().enumerate() {
            writeln!(
                stdout,
                "  {}) {:<32} {}",
                index + 1,
                descriptor.label,
                descriptor.description
            )?;
        }

        loop {
            write!(stdout, "provider [1-{}]: ", options.len())?;
            stdout.flush()?;

            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let answer = line.trim();
            if answer.is_empty() {
                continue;
            }
            if let Some(descriptor) = answer
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|index| options.get(index))
            {
                return Ok(Some(descriptor.id.to_owned()));
            }
            // Ids are accepted as well as numbers; the selector rejects unknown ones.
            return Ok(Some(answer.to_owned()));
        }
    }
}

fn print_flags(flags: &FrontendFlags) {
    println!(
        "[{}] user={} new-badge={} cta-color={} ({})",
        flags.provider,
        flags.user_id,
        flags.new_badge,
        flags.cta_color,
        flags.refreshed_at.to_rfc3339()
    );
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_line() -> Result<Option<String>> {
    let line = tokio::task::spawn_blocking(|| -> io::Result<Option<String>> {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line)? {
            0 => Ok(None),
            _ => Ok(Some(line.trim().to_owned())),
        }
    })
    .await
    .map_err(|err| Error::from(io::Error::new(io::ErrorKind::Other, err)))??;
    Ok(line)
}

async fn run(selector: ProviderSelector, users: Vec<String>) -> Result<()> {
    let settings = selector.settings().clone();
    let backend = BackendClient::new(settings.backend())?;

    let descriptor = selector.ensure_choice(&mut StdinPrompt)?;
    let mut session = FlagSession::start(descriptor, settings, backend).await?;
    print_flags(&session.flags());

    for user in users {
        print_flags(&session.refresh(&user).await?);
    }

    println!("Enter a user id to refresh, `:switch` to change provider, `:quit` to exit.");
    while let Some(line) = read_line().await? {
        match line.as_str() {
            "" => print_flags(&session.flags()),
            ":quit" => break,
            ":switch" => {
                session = session.switch_provider(&selector, &mut StdinPrompt).await?;
                print_flags(&session.flags());
            }
            user => match session.refresh(user).await {
                Ok(flags) => print_flags(&flags),
                Err(err) => eprintln!("refresh failed: {}", err),
            },
        }
    }

    session.shutdown().await
}

async fn execute(args: Args) -> Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(state_file) = args.state_file {
        settings = settings.state_file(state_file);
    }
    if let Some(documents) = args.documents {
        settings = settings.documents_base(documents);
    }
    if let Some(backend) = args.backend {
        settings = settings.backend_url(backend);
    }

    let registry = Registry::builtin();
    let store = FileChoiceStore::new(settings.state_path());
    let selector = ProviderSelector::new(registry, store, settings.clone());

    match args.command {
        Command::Run { users } => run(selector, users).await,
        Command::Switch => {
            selector.switch_provider()?;
            println!("Provider choice cleared. The next run will ask again.");
            Ok(())
        }
        Command::Providers => {
            let persisted = selector.persisted_choice();
            let available = selector.registry().available(&settings);
            for descriptor in selector.registry().descriptors() {
                let chosen = persisted.as_deref() == Some(descriptor.id);
                let usable = available.iter().any(|d| d.id == descriptor.id);
                println!(
                    "{} {:<11} {:<32} {}{}",
                    if chosen { "*" } else { " " },
                    descriptor.id,
                    descriptor.label,
                    descriptor.description,
                    if usable { "" } else { " (unavailable)" }
                );
            }
            Ok(())
        }
        Command::Hello { user } => {
            let backend = BackendClient::new(settings.backend())?;
            print_json(&backend.hello(&user).await?)
        }
        Command::Secret { user } => {
            let backend = BackendClient::new(settings.backend())?;
            print_json(&backend.secret(&user).await?)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("flagswitch=info"))
        .init();

    let args = Args::parse();
    if let Err(err) = execute(args).await {
        log::error!(target: "flagswitch", "{}", err);
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
