/*!
# graphsync-rust demo

Builds a block chain on one in-memory node and fetches it from another.

```bash
cargo run -- --help
cargo run -- --length 500 --block-size 65536 --bandwidth 4000000
cargo run -- --config graphsync --store /tmp/graphsync-blocks
```
*/

use graphsync_rust::runtime;

#[tokio::main]
pub async fn main() -> graphsync_rust::Result<()> {
    tracing_subscriber::fmt::init();
    runtime::run().await
}
