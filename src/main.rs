use std::panic;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use cpp_harness::constants::{DEFAULT_BENCHMARK_REPEATS, DEFAULT_BENCHMARK_WARMUPS};
use cpp_harness::{
    BenchmarkPlan, CancelToken, Harness, HarnessConfig, HarnessError, Limits, NetworkPolicy,
    Submission,
};

#[derive(Debug, Parser)]
#[command(name = "cpp-harness", version, about = "Compile and run a C++ file under limits")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile and run once, print the report as JSON.
    Run {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Compile once, run repeatedly and print timing statistics as JSON.
    Bench {
        #[command(flatten)]
        request: RequestArgs,
        #[arg(long, default_value_t = DEFAULT_BENCHMARK_WARMUPS)]
        warmups: usize,
        #[arg(long, default_value_t = DEFAULT_BENCHMARK_REPEATS)]
        repeats: usize,
    },
}

#[derive(Debug, Args)]
struct RequestArgs {
    /// C++ source file.
    source: PathBuf,
    #[arg(long)]
    wall_ms: u64,
    /// Defaults to the wall-clock limit.
    #[arg(long)]
    cpu_ms: Option<u64>,
    #[arg(long)]
    memory_bytes: u64,
    #[arg(long)]
    output_bytes: u64,
    /// File whose contents are fed to the program's standard input.
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// Overrides HARNESS_NETWORK.
    #[arg(long, value_enum)]
    network: Option<NetworkPolicy>,
    /// Arguments passed to the program.
    #[arg(last = true)]
    args: Vec<String>,
}

impl RequestArgs {
    fn limits(&self) -> Limits {
        Limits {
            wall_time_ms: Some(self.wall_ms),
            cpu_time_ms: Some(self.cpu_ms.unwrap_or(self.wall_ms)),
            memory_bytes: Some(self.memory_bytes),
            output_bytes: Some(self.output_bytes),
        }
    }

    async fn submission(&self) -> std::io::Result<Submission> {
        let source = tokio::fs::read(&self.source).await?;
        let stdin = match &self.stdin {
            Some(path) => tokio::fs::read(path).await?,
            None => Vec::new(),
        };
        Ok(Submission::new(source)
            .with_args(self.args.iter().cloned())
            .with_stdin(stdin))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let mut config = HarnessConfig::from_env()?;
    let request = match &cli.command {
        Command::Run { request } | Command::Bench { request, .. } => request,
    };
    if let Some(network) = request.network {
        config.network = network;
    }

    let submission = request.submission().await?;
    let limits = request.limits();
    let harness = Harness::native(config);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            trigger.cancel();
        }
    });

    let output = match cli.command {
        Command::Run { .. } => harness
            .submit_with_cancel(&submission, &limits, &cancel)
            .await
            .map(serde_json::to_value),
        Command::Bench {
            warmups, repeats, ..
        } => harness
            .benchmark_with_cancel(
                &submission,
                &limits,
                BenchmarkPlan { warmups, repeats },
                &cancel,
            )
            .await
            .map(serde_json::to_value),
    };

    match output {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value?)?);
            Ok(())
        }
        Err(e) => {
            report_error(&e);
            std::process::exit(1);
        }
    }
}

fn report_error(error: &HarnessError) {
    tracing::error!("Harness error: {}", error);
    let body = json!({
        "result": "harness_error",
        "error": error.to_string(),
        "retryable": error.is_retryable(),
    });
    println!("{}", body);
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
