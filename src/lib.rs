/*!
# graphsync-rust

A content-addressed DAG exchange. A requestor names a root link and a
selector; the responder walks its block store under that selector and streams
back every block the walk loads, while the requestor runs the same walk
locally, verifying and storing each block as it arrives.

# Layout

- `node`, `link`, `block` and `path` model the DAG.
- `selector` parses selector specs and `traversal` walks a DAG under one.
- `networking` holds the wire messages, per-peer message queues and an
  in-memory network for tests and the demo binary.
- `request_manager` and `response_manager` drive the two sides of the
  protocol; `graphsync` wires them to a network and a `storage::BlockStore`.

# Usage

```bash
cargo run -- --length 200 --block-size 4096
```
*/
pub mod block;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod extension;
pub mod graphsync;
pub mod hooks;
pub mod link;
pub mod networking;
pub mod node;
pub mod path;
pub mod request_manager;
pub mod response_manager;
pub mod runtime;
pub mod selector;
pub mod storage;
pub mod stream;
pub mod test_utilities;
pub mod traversal;

#[cfg(test)]
mod test_setup;

pub use crate::error::{GraphsyncError, Result};
pub use crate::graphsync::GraphSync;
