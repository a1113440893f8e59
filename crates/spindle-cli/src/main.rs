//! Spindle command-line driver
//!
//! Runs small workloads against the scheduler core and reports what the
//! pool did.

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "Work-stealing task scheduler driver", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit counter increments and verify every one ran exactly once
    Count {
        /// Number of tasks to submit
        #[arg(short, long, default_value_t = 100_000)]
        tasks: usize,
        /// Worker threads (defaults to the number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Pop newest-first from local deques
        #[arg(long)]
        lifo: bool,
    },

    /// Stress the lock-free queue with concurrent producers and consumers
    Queue {
        /// Producer threads
        #[arg(short, long, default_value_t = 4)]
        producers: usize,
        /// Consumer threads
        #[arg(short, long, default_value_t = 4)]
        consumers: usize,
        /// Items pushed by each producer
        #[arg(short, long, default_value_t = 100_000)]
        items: usize,
    },

    /// Show build and platform information
    Info,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count {
            tasks,
            workers,
            lifo,
        } => commands::count::execute(tasks, workers.unwrap_or_else(num_cpus::get), lifo),

        Commands::Queue {
            producers,
            consumers,
            items,
        } => commands::queue::execute(producers, consumers, items),

        Commands::Info => commands::info::execute(),
    }
}
