//! # Cgbroker
//! A privileged broker that lets unprivileged, possibly namespaced clients
//! manage their own control group subtrees. Clients connect over a local
//! socket; every identity involved in a request is attested by the kernel,
//! either at connect time or through an explicit credential handshake.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Result;
use clap::Parser;

use cgbroker::bootstrap;
use cgbroker::logger;
use cgbroker::server::Server;
use cgfs::common::DEFAULT_CGROUP_ROOT;
use cgfs::ns::NsIds;

#[derive(Parser, Debug)]
#[clap(version = "0.1.0", about = "The control group broker daemon")]
struct Opts {
    /// Detach and run in the background
    #[clap(short, long)]
    daemon: bool,
    /// Log to this file instead of stderr
    #[clap(short, long)]
    log: Option<PathBuf>,
    /// Log record format, "text" or "json"
    #[clap(long)]
    log_format: Option<String>,
}

fn main() {
    let opts = Opts::parse();

    if let Err(e) = logger::init(opts.log.clone(), opts.log_format.clone()) {
        eprintln!("log init failed: {:?}", e);
    }

    if let Err(e) = run(&opts) {
        log::error!("{:#}", e);
        process::exit(1);
    }
}

fn run(opts: &Opts) -> Result<()> {
    let socket = bootstrap::setup_socket_dir(Path::new(DEFAULT_CGROUP_ROOT))?;

    let ns_ids = NsIds::snapshot();
    log::info!(
        "pid namespace {:?}, user namespace {:?}",
        ns_ids.pid_ns,
        ns_ids.user_ns
    );

    let mut server = Server::bind(&socket, ns_ids)?;
    log::info!("listening on {}", socket.display());

    if opts.daemon {
        bootstrap::daemonise()?;
    }

    server.run()
}
