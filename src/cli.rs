use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trawler", about = "Distributed web crawler")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log file path (logs to stderr when absent)
    #[arg(long)]
    pub log_file: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Seed URLs into the broker and aggregate worker results
    Master {
        /// Seed URLs (comma-separated)
        #[arg(long = "seed-urls", value_delimiter = ',')]
        seed_urls: Vec<String>,
    },
    /// Pull tasks from the broker and crawl
    Worker {
        /// Worker id prefix (defaults to config / WORKER_ID)
        #[arg(long)]
        worker_id: Option<String>,

        /// Number of worker loops to run in this process
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Crawl a fixed URL list in-process, without a broker
    Standalone {
        /// URLs to crawl (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        urls: Vec<String>,
    },
    /// Fire repeated requests at one URL and report throughput
    Benchmark {
        /// Target URL
        #[arg(long)]
        url: String,

        /// Total requests
        #[arg(long, default_value_t = 100)]
        requests: usize,

        /// Concurrent requests
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
    },
    /// Show queue and storage statistics
    Stats,
}
