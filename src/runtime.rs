use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{App, Arg, ArgMatches};
use futures::StreamExt;
use tokio::signal;
use tracing::{event, Level};

use crate::config::GraphSyncConfig;
use crate::context::RequestContext;
use crate::error::{GraphsyncError, Result};
use crate::graphsync::GraphSync;
use crate::networking::memory::{LinkOptions, MemoryNetwork};
use crate::networking::peer::PeerId;
use crate::storage::{BlockStore, FileStore, MemoryStore};
use crate::test_utilities::test_manager::{RandomBytes, TestBlockChain};

///
/// The entry point to the demo runtime
///
pub async fn run() -> Result<()> {
    let matches = App::new("graphsync-rust")
        .about("Fetches a generated block chain between two in-memory nodes")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("config file name"),
        )
        .arg(
            Arg::with_name("length")
                .short("l")
                .long("length")
                .default_value("100")
                .takes_value(true)
                .help("number of blocks in the chain"),
        )
        .arg(
            Arg::with_name("block-size")
                .short("b")
                .long("block-size")
                .default_value("1024")
                .takes_value(true)
                .help("payload bytes per block"),
        )
        .arg(
            Arg::with_name("bandwidth")
                .long("bandwidth")
                .takes_value(true)
                .help("link bandwidth in bytes per second"),
        )
        .arg(
            Arg::with_name("latency")
                .long("latency")
                .default_value("0")
                .takes_value(true)
                .help("link latency in milliseconds"),
        )
        .arg(
            Arg::with_name("store")
                .short("s")
                .long("store")
                .takes_value(true)
                .help("directory the requestor writes fetched blocks to"),
        )
        .get_matches();

    let runtime = Runtime::from_matches(&matches)?;

    //
    // initiate runtime and handle results
    //
    tokio::select! {
        res = runtime.run() => {
            if let Err(err) = res {
                event!(Level::ERROR, "{}", err);
                return Err(err);
            }
        },
        _ = signal::ctrl_c() => {
            event!(Level::INFO, "Shutting down!");
        }
    }

    Ok(())
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>> {
    match matches.value_of(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| GraphsyncError::Config(format!("invalid value for --{}: {}", name, value))),
        None => Ok(None),
    }
}

struct Runtime {
    config: GraphSyncConfig,
    length: usize,
    block_size: usize,
    link: LinkOptions,
    store_path: Option<String>,
}

impl Runtime {
    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let config_name = matches.value_of("config").unwrap_or("config");
        let config = GraphSyncConfig::load(config_name)?;
        let length = parse_arg::<usize>(matches, "length")?.unwrap_or(100);
        if length < 2 {
            return Err(GraphsyncError::Config(String::from(
                "a chain needs at least two blocks",
            )));
        }
        let latency = parse_arg::<u64>(matches, "latency")?.unwrap_or(0);
        Ok(Runtime {
            config,
            length,
            block_size: parse_arg::<usize>(matches, "block-size")?.unwrap_or(1024),
            link: LinkOptions {
                latency: Duration::from_millis(latency),
                bandwidth: parse_arg::<u64>(matches, "bandwidth")?,
            },
            store_path: matches.value_of("store").map(String::from),
        })
    }

    async fn run(&self) -> Result<()> {
        let network = MemoryNetwork::new(self.config.max_decode_size);
        network.set_link_defaults(self.link);

        //
        // the responder holds the chain
        //
        let responder_store = Arc::new(MemoryStore::new());
        let chain = TestBlockChain::setup(
            &*responder_store,
            &mut RandomBytes::new(rand::random()),
            self.block_size,
            self.length,
        )?;
        let responder_node = network.add_node_with_id(PeerId::from_label("responder")).await;
        let responder = GraphSync::new(responder_node, responder_store, self.config.clone());
        event!(
            Level::INFO,
            "responder {} holds {} blocks, tip {}",
            responder.local_peer(),
            chain.len(),
            chain.tip_link
        );

        //
        // the requestor fetches it
        //
        let requestor_store: Arc<dyn BlockStore> = match &self.store_path {
            Some(path) => Arc::new(FileStore::new(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let requestor_node = network.add_node_with_id(PeerId::from_label("requestor")).await;
        let requestor = GraphSync::new(requestor_node, requestor_store, self.config.clone());

        let started = Instant::now();
        let (mut responses, mut errors) = requestor
            .request(
                RequestContext::new(),
                responder.local_peer(),
                chain.tip_link,
                chain.selector(),
                vec![],
            )
            .await;

        let mut visited = 0;
        while let Some(progress) = responses.next().await {
            visited += 1;
            if let Some(last_block) = &progress.last_block {
                if last_block.path == progress.path {
                    event!(Level::DEBUG, "fetched {} at '{}'", last_block.link, progress.path);
                }
            }
        }
        let failure = errors.next().await;
        let stats = network.frame_stats();
        event!(
            Level::INFO,
            "visited {} nodes in {:?} over {} frames ({} bytes, largest {})",
            visited,
            started.elapsed(),
            stats.frames,
            stats.bytes,
            stats.max_frame
        );

        requestor.shutdown().await;
        responder.shutdown().await;
        match failure {
            Some(err) => Err(err),
            None => {
                event!(Level::INFO, "request finished: {:?}", errors.terminal_status());
                Ok(())
            }
        }
    }
}
