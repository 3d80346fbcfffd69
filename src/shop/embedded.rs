use rust_embed::RustEmbed;

/// The storefront bundle in `web/`, compiled into the binary.
#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/web/"]
pub struct Assets;
