mod configuration;
mod error;
mod render;

use anyhow::{Context, Result};
use clap::Parser;
use cliclack::input;
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use configuration::{SandboxBackend, Settings, DEFAULT_SYSTEM_MESSAGE};
use minichain::agent::Agent;
use minichain::cache::DiskCache;
use minichain::providers::base::Provider;
use minichain::providers::cached::CachedProvider;
use minichain::providers::openai::OpenAiProvider;
use minichain::sandbox::{
    BashSession, CodeInterpreter, ContainerBackend, DockerBackend, HostShellBackend,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The task to solve; asked for interactively when omitted
    task: Option<String>,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// OpenAI API Key (can also be set via OPENAI_API_KEY environment variable)
    #[arg(long)]
    api_key: Option<String>,

    /// Base URL of an OpenAI compatible endpoint
    #[arg(long)]
    host: Option<String>,

    /// Where shell commands run
    #[arg(long, value_enum)]
    backend: Option<SandboxBackend>,

    /// Container image for the docker backend
    #[arg(long)]
    image: Option<String>,

    /// Messages after the system message always sent to the model
    #[arg(long)]
    keep_first: Option<usize>,

    /// Most recent messages sent to the model
    #[arg(long)]
    keep_last: Option<usize>,

    /// Stop after this many completions without an answer
    #[arg(long)]
    max_turns: Option<usize>,

    /// File holding the system message
    #[arg(long)]
    system_prompt_file: Option<PathBuf>,

    /// Memoize completions on disk
    #[arg(long)]
    cache: bool,

    /// Exit after the first answer instead of asking for follow-ups
    #[arg(long)]
    once: bool,
}

impl Cli {
    /// Flags as configuration overrides
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        let mut set = |key: &'static str, value: Option<String>| {
            if let Some(value) = value {
                overrides.push((key, value));
            }
        };
        set("provider.model", self.model.clone());
        set("provider.api_key", self.api_key.clone());
        set("provider.host", self.host.clone());
        set(
            "sandbox.backend",
            self.backend.map(|backend| match backend {
                SandboxBackend::Docker => "docker".to_string(),
                SandboxBackend::Host => "host".to_string(),
            }),
        );
        set("sandbox.image", self.image.clone());
        set("agent.keep_first", self.keep_first.map(|n| n.to_string()));
        set("agent.keep_last", self.keep_last.map(|n| n.to_string()));
        set("agent.max_turns", self.max_turns.map(|n| n.to_string()));
        if self.cache {
            set("cache.enabled", Some("true".to_string()));
        }
        overrides
    }
}

fn init_logging() {
    // Transcript goes to stdout, logs to stderr
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = Settings::load(&cli.overrides())?;

    let model = settings.provider.model.clone();
    let provider: Arc<dyn Provider> = {
        let openai = OpenAiProvider::new(settings.provider.into_config()?)?;
        if settings.cache.enabled {
            let cache = DiskCache::open(&settings.cache.dir)
                .with_context(|| format!("Failed to open cache {}", settings.cache.dir.display()))?;
            Arc::new(CachedProvider::new(openai, cache, model))
        } else {
            Arc::new(openai)
        }
    };

    let cwd = std::env::current_dir()?;
    let (backend, exec_dir): (Arc<dyn ContainerBackend>, String) = match settings.sandbox.backend {
        SandboxBackend::Docker => {
            let mount = settings.sandbox.mount.clone().unwrap_or_else(|| cwd.clone());
            let config = settings.sandbox.docker_config(&mount);
            (Arc::new(DockerBackend::new(config)), settings.sandbox.workdir.clone())
        }
        SandboxBackend::Host => (
            Arc::new(HostShellBackend::new(&cwd)),
            cwd.display().to_string(),
        ),
    };
    let host_dir = settings.sandbox.mount.clone().unwrap_or_else(|| cwd.clone());
    let bash = Arc::new(BashSession::new(backend));
    let python = Arc::new(CodeInterpreter::new(bash.clone(), host_dir, exec_dir));

    let system_message = match &cli.system_prompt_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read system prompt {}", path.display()))?,
        None => settings
            .agent
            .system_message
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_MESSAGE.to_string()),
    };

    let mut builder = Agent::builder(provider, system_message)
        .function(bash.function())
        .function(python.function())
        .keep_first(settings.agent.keep_first)
        .keep_last(settings.agent.keep_last)
        .on_assistant_message(render::print_message)
        .on_function_message(render::print_message);
    if let Some(max_turns) = settings.agent.max_turns {
        builder = builder.max_turns(max_turns);
    }
    let agent = builder.build()?;

    let task = match cli.task {
        Some(task) => task,
        None => input("Task:").placeholder("").multiline().interact()?,
    };

    let mut session = agent.session();
    let mut result = session.run_task(&task).await;
    loop {
        match &result {
            Ok(output) => println!("{}\n", style(output).green()),
            Err(e) => eprintln!("{} {}\n", style("error:").red().bold(), e),
        }
        if cli.once {
            break;
        }

        let message: String = input(format!(
            "Follow up {}",
            style("(type \"exit\" to end the session)").dim()
        ))
        .placeholder("")
        .multiline()
        .interact()?;
        if message.trim().eq_ignore_ascii_case("exit") {
            break;
        }
        result = session.follow_up(message).await;
    }

    if let Err(e) = bash.stop().await {
        tracing::warn!(error = %e, "failed to stop sandbox");
    }
    // the error was already printed above
    if cli.once && result.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
