//! helm - run the tool-calling loop from a terminal

mod config;
mod display;
mod tools;

use clap::Parser;
use helm_agent::hooks::HookService;
use helm_agent::telemetry::TelemetrySession;
use helm_agent::{
    BoxedTool, Conversation, ConversationRenderer, DisplaySink, LoopConfig, LoopDependencies, LoopHandle,
    LoopStopReason, PromptRenderer, StaticToolRegistry, ToolCallingLoop, ToolRegistry,
};
use helm_ai::{Api, FetchTransport, HttpFetchTransport, Model};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

/// helm - agentic tool-calling loop
#[derive(Parser, Debug)]
#[command(name = "helm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run a single turn with this prompt instead of reading from stdin
    prompt: Option<String>,

    /// Provider (anthropic, openai, groq, openrouter, xai, ollama)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use (default: claude-sonnet-4-5)
    #[arg(short, long)]
    model: Option<String>,

    /// Override the provider's base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Iterations allowed per turn after the first
    #[arg(long)]
    tool_call_limit: Option<u32>,

    /// Config file (default: ~/.config/helm/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn build_system_prompt(tool_names: &[String]) -> String {
    format!(
        "You are helm, a coding assistant working in {}.\n\
         Available tools: {}.\n\
         Read files before describing them. When the task is done, answer without calling tools.",
        std::env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|_| ".".to_string()),
        tool_names.join(", ")
    )
}

/// Everything needed to run one turn after another
struct Session {
    config: LoopConfig,
    renderer: Arc<dyn PromptRenderer>,
    transport: Arc<dyn FetchTransport>,
    registry: Arc<dyn ToolRegistry>,
    hooks: Option<Arc<dyn HookService>>,
    sink: Arc<dyn DisplaySink>,
    telemetry: Arc<Mutex<TelemetrySession>>,
    handle: LoopHandle,
    conversation: Conversation,
    verbose: bool,
}

impl Session {
    async fn run_turn(&mut self, request: &str) {
        let input = self.conversation.begin_turn(request);
        let mut deps = LoopDependencies::new(
            Arc::clone(&self.renderer),
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            Arc::clone(&self.sink),
        )
        .with_telemetry(Arc::clone(&self.telemetry));
        if let Some(hooks) = &self.hooks {
            deps = deps.with_hooks(Arc::clone(hooks));
        }

        let tool_loop = ToolCallingLoop::new(self.config.clone(), deps, input)
            .with_handle(self.handle.clone());
        let mut receiver = tool_loop.subscribe();
        let verbose = self.verbose;
        let printer = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                display::print_event(&event, verbose);
            }
        });

        let outcome = tool_loop.run().await;
        // The loop owned the sender, so the printer drains and exits
        let _ = printer.await;

        match &outcome {
            Ok(outcome) => {
                match outcome.stop_reason {
                    LoopStopReason::Yielded => println!("[Stopped early]"),
                    LoopStopReason::Cancelled => println!("[Cancelled]"),
                    LoopStopReason::StopHookCap => println!("[Stop hook kept blocking; turn ended]"),
                    _ => {}
                }
                println!(
                    "[Tokens: {} in, {} out | {} iterations]",
                    outcome.usage.prompt_tokens, outcome.usage.completion_tokens, outcome.iterations
                );
            }
            Err(e) if e.is_cancellation() => println!("[{}]", e),
            Err(_) => {}
        }
        self.conversation.record(&outcome);
    }
}

/// First Ctrl-C yields, the second cancels. Idle Ctrl-C exits.
fn spawn_interrupt_handler(handle: LoopHandle) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !handle.is_running() {
                std::process::exit(130);
            }
            if handle.yield_requested() {
                eprintln!("\n[Cancelling]");
                handle.cancel();
            } else {
                eprintln!("\n[Finishing the current step; Ctrl-C again to cancel]");
                handle.request_yield();
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("helm=debug,helm_agent=debug,helm_ai=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load(args.config.as_deref());

    // CLI takes precedence over the config file
    let provider = args
        .provider
        .or(cfg.provider.clone())
        .unwrap_or_else(|| "anthropic".to_string());
    let model_id = args
        .model
        .or(cfg.model.clone())
        .unwrap_or_else(|| "claude-sonnet-4-5".to_string());
    let Some(api) = Api::from_provider(&provider) else {
        anyhow::bail!("Unknown provider: {}", provider);
    };
    let mut model = Model::new(model_id, api);
    if let Some(base_url) = args.base_url.or(cfg.base_url.clone()) {
        model.base_url = base_url;
    }

    let env_var = api.api_key_env_var();
    let Some(api_key) = cfg.get_api_key(&provider, env_var) else {
        eprintln!("Error: No API key found for {}", provider);
        eprintln!("Set your API key with: export {}=your-key", env_var);
        eprintln!("Or add it to config file: helm --init-config");
        std::process::exit(1);
    };

    let mut loop_config = cfg.loop_config.clone();
    if let Some(limit) = args.tool_call_limit {
        loop_config.tool_call_limit = limit;
    }
    loop_config.max_tokens.get_or_insert(model.max_tokens);
    loop_config.validate()?;

    let registry = Arc::new(StaticToolRegistry::with_tools(vec![
        Arc::new(tools::ReadFileTool::new()) as BoxedTool,
        Arc::new(tools::ListDirTool::new()),
    ]));
    let tool_names: Vec<String> = registry
        .available_tools()
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    let system_prompt = cfg
        .system_prompt()
        .or(loop_config.system_prompt.clone())
        .unwrap_or_else(|| build_system_prompt(&tool_names));

    let renderer = ConversationRenderer::new(registry.clone(), loop_config.prompt_token_budget)
        .with_system_prompt(Some(system_prompt))
        .with_ignored_paths(cfg.ignored_paths.clone());

    let hooks = cfg
        .hooks
        .service()
        .map(|service| Arc::new(service) as Arc<dyn HookService>);

    tracing::debug!(model = %model.id, ?api, "starting helm");
    let handle = LoopHandle::new();
    spawn_interrupt_handler(handle.clone());

    let mut session = Session {
        config: loop_config,
        renderer: Arc::new(renderer),
        transport: Arc::new(HttpFetchTransport::new(model.clone(), api_key)),
        registry,
        hooks,
        sink: Arc::new(display::TerminalSink::new(args.verbose)),
        telemetry: Arc::new(Mutex::new(TelemetrySession::default())),
        handle,
        conversation: Conversation::new(),
        verbose: args.verbose,
    };

    if let Some(prompt) = args.prompt {
        println!("helm> {}", prompt);
        println!();
        session.run_turn(&prompt).await;
        return Ok(());
    }

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("helm ({})", model.id);
        eprintln!();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/exit" || input == "/quit" {
            break;
        }
        session.run_turn(input).await;
        println!();
    }

    Ok(())
}
