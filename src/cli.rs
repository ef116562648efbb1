use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "boss-dl")]
#[command(author, version, about = "Bounded download scheduler with per-user quotas and CLI/API strategies", long_about = None)]
pub struct Cli {
    /// Override the download directory (DOWNLOAD_FOLDER)
    #[arg(long, global = true)]
    pub output: Option<String>,

    /// Override the number of concurrent downloads (BOSS_MAX_CONCURRENT)
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue URLs and run until every download has finished
    Fetch {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Requester id the downloads are charged to
        #[arg(short, long, default_value_t = 0)]
        requester: u64,

        /// Print queue events as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Read commands from stdin (add/cancel/pause/resume/status/quota/quit)
    Serve {
        /// Print queue events as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Show the detected platform and the strategies chosen for a URL
    Check {
        url: String,
    },

    /// Print the Prometheus metrics exposition
    Metrics,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
