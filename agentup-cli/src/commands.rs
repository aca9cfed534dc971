use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enable automatic updates and install the cluster's target version
    Enable {
        /// Proxy address used for version discovery (host[:port])
        #[arg(long)]
        proxy: Option<String>,

        /// Update group identifier for staged rollouts
        #[arg(long)]
        group: Option<String>,

        /// Download URL template override (must use https://)
        #[arg(long = "template")]
        url_template: Option<String>,

        /// Install the given version instead of asking the proxy
        #[arg(long)]
        force_version: Option<String>,
    },

    /// Disable automatic updates (leaves the installation untouched)
    Disable,

    /// Show the persisted update configuration
    Status,
}
