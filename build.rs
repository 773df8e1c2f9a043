use std::{env, fs::File, io::Write, path::Path};

// Defaults baked into the library. Runtime settings files override these, and
// for production builds they can also be set via environmental variables, e.g.
// GRAPHSYNC_MAX_MESSAGE_SIZE=4194304 cargo build
const MAX_MESSAGE_SIZE: usize = 512 * 1024;
const MAX_PENDING_BLOCK_BYTES: usize = 4 * 1024 * 1024;

fn main() {
    write_defaults_to_constants();
}

fn write_defaults_to_constants() {
    let out_dir = env::var("OUT_DIR").expect("No out dir");
    let dest_path = Path::new(&out_dir).join("constants.rs");
    let max_message_size = option_env!("GRAPHSYNC_MAX_MESSAGE_SIZE")
        .map_or(Ok(MAX_MESSAGE_SIZE), str::parse)
        .expect("Could not parse GRAPHSYNC_MAX_MESSAGE_SIZE");
    let max_pending_block_bytes = option_env!("GRAPHSYNC_MAX_PENDING_BLOCK_BYTES")
        .map_or(Ok(MAX_PENDING_BLOCK_BYTES), str::parse)
        .expect("Could not parse GRAPHSYNC_MAX_PENDING_BLOCK_BYTES");
    let mut f = File::create(&dest_path).expect("Could not create file");
    writeln!(
        &mut f,
        "pub const DEFAULT_MAX_MESSAGE_SIZE: usize = {};",
        max_message_size
    )
    .expect("Could not write file");
    writeln!(
        &mut f,
        "pub const DEFAULT_MAX_PENDING_BLOCK_BYTES: usize = {};",
        max_pending_block_bytes
    )
    .expect("Could not write file");
    println!("cargo:rerun-if-env-changed=GRAPHSYNC_MAX_MESSAGE_SIZE");
    println!("cargo:rerun-if-env-changed=GRAPHSYNC_MAX_PENDING_BLOCK_BYTES");
}
