use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Queue server to connect to, as host:port. Repeatable; puts rotate
    /// across servers and reserves favour whichever answers quickly.
    #[arg(short, long = "server", required = true)]
    pub(crate) servers: Vec<String>,
    /// Application version tag. Jobs are enqueued to (and reserved from) the
    /// tube named after it, so mixed worker fleets only run their own jobs.
    #[arg(short, long)]
    pub(crate) app_version: Option<String>,
    /// Seconds to sleep after a failed connect or reserve.
    #[arg(long, default_value_t = 60)]
    pub(crate) sleep_time: u64,
    /// Seconds a job whose entity is missing may age before being dropped.
    #[arg(long, default_value_t = 60)]
    pub(crate) stale_after: u32,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
