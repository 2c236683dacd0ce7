use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    FileDefinitionSource, GracefulShutdown, PluginRegistry, Switchyard,
    config::{
        DefinitionValidator, GatewayConfig, GatewayConfigValidator, load_definition,
        load_gateway_config,
    },
    metrics,
    ports::definition_source::DefinitionSource,
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Gateway settings file (YAML, JSON or TOML). Environment variables
    /// prefixed with SWITCHYARD_ override it.
    #[clap(short, long, global = true)]
    config: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Start the gateway server (default)
    Serve {
        /// Route definition file, overrides `definition_path`
        #[clap(short, long)]
        definition: Option<String>,
        /// Address to listen on, overrides `listen_addr`
        #[clap(short, long)]
        listen: Option<String>,
        /// Do not watch the definition file for changes
        #[clap(long)]
        no_watch: bool,
    },
    /// Validate a route definition file
    Validate {
        /// Route definition file to validate
        #[clap(short, long)]
        definition: Option<String>,
    },
    /// Write a sample route definition file
    Init {
        /// Output path for the new definition file
        #[clap(short, long, default_value = "apis.yaml")]
        definition: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Init { definition }) => init_definition_command(&definition).await,
        Some(Commands::Validate { definition }) => {
            let config = load_gateway_config(args.config.as_deref())?;
            let path = definition.unwrap_or(config.definition_path);
            validate_definition_command(&path)
        }
        Some(Commands::Serve {
            definition,
            listen,
            no_watch,
        }) => {
            let mut config = load_gateway_config(args.config.as_deref())?;
            if let Some(definition) = definition {
                config.definition_path = definition;
            }
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if no_watch {
                config.watch = false;
            }
            serve(config).await
        }
        None => serve(load_gateway_config(args.config.as_deref())?).await,
    }
}

async fn serve(config: GatewayConfig) -> Result<()> {
    tracing_setup::init_tracing_with_config(&config.log)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics();

    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid gateway configuration: {}", e))?;

    tracing::info!(
        definition = %config.definition_path,
        watch = config.watch,
        "Loading initial route definition"
    );

    let source: Arc<dyn DefinitionSource> = if config.watch {
        Arc::new(
            FileDefinitionSource::watched(&config.definition_path)
                .context("Failed to watch definition file")?,
        )
    } else {
        Arc::new(FileDefinitionSource::new(&config.definition_path))
    };

    let gateway =
        Switchyard::build(&config, PluginRegistry::with_builtin_plugins(), source).await?;

    // Create graceful shutdown manager
    let graceful_shutdown = Arc::new(GracefulShutdown::with_timeout(config.grace_timeout));

    // Start signal handler for graceful shutdown
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let watcher = gateway.spawn_watcher(&graceful_shutdown);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", config.listen_addr))?;

    println!("Switchyard gateway listening on {}", config.listen_addr);

    gateway.serve(listener, graceful_shutdown.clone()).await?;

    if let Some(watcher) = watcher
        && let Err(e) = watcher.await
    {
        tracing::warn!("Definition watcher ended abnormally: {}", e);
    }
    Ok(())
}

/// Validate a definition file and exit
fn validate_definition_command(definition_path: &str) -> Result<()> {
    println!("🔍 Validating route definition: {definition_path}");

    if !Path::new(definition_path).exists() {
        eprintln!("❌ Error: Definition file '{definition_path}' not found");
        std::process::exit(1);
    }

    let definition = match load_definition(definition_path) {
        Ok(definition) => {
            println!("✅ Definition parsing: OK");
            definition
        }
        Err(e) => {
            eprintln!("❌ Definition parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    let registry = PluginRegistry::with_builtin_plugins();
    match DefinitionValidator::validate(&definition, &registry) {
        Ok(()) => {
            println!("✅ Definition validation: OK");
            println!();
            println!("📋 Definition Summary:");
            for api in &definition.apis {
                let methods = if api.proxy.methods.is_empty() {
                    "ANY".to_string()
                } else {
                    api.proxy.methods.join(",")
                };
                println!(
                    "   • {} {} {} -> {}",
                    api.name, methods, api.proxy.path, api.proxy.upstream.target
                );
            }
            println!();
            println!("🎉 Definition is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Definition validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Paths must start with '/' and use balanced {{name}} captures");
            println!("   • Upstream targets must be absolute http:// or https:// URLs");
            println!("   • Every upstream placeholder must be captured by the path");
            println!("   • Plugins available: {}", registry.names().join(", "));
            std::process::exit(1);
        }
    }
}

/// Write a sample definition file
async fn init_definition_command(definition_path: &str) -> Result<()> {
    let path = Path::new(definition_path);
    if path.exists() {
        eprintln!("❌ Error: Definition file '{definition_path}' already exists");
        std::process::exit(1);
    }

    let sample_definition = r#"# Switchyard route definitions
#
# APIs are matched in order. A path matches exactly, or as a prefix at a
# '/' boundary; the unmatched remainder is appended to the upstream path
# unless `fixed_path` is set.
apis:
  - name: user-tasks
    proxy:
      path: /users/{userId}/tasks/{taskId}
      methods: [GET]
      upstream:
        target: http://localhost:3001/apis/v1/users/{userId}/tasks/{taskId}
        fixed_path: true
    plugins:
      - name: rate
        config:
          limit: 10
          per: s
          vary_by: ip

  # Listed after user-tasks: `/users` also matches every path below it.
  - name: users
    proxy:
      path: /users
      methods: [GET, POST]
      upstream:
        target: http://localhost:3000/users
"#;

    tokio::fs::write(path, sample_definition)
        .await
        .context("Failed to write definition file")?;
    println!("✅ Created sample definition at: {definition_path}");
    println!("   Run 'switchyard serve --definition {definition_path}' to start the server");
    Ok(())
}
