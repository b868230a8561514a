//! Identifier generation and decoding

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Returns the human readable part of a bech32 id, if the string decodes.
pub fn bech32_hrp(id: &str) -> Option<String> {
    bech32::decode(id)
        .ok()
        .map(|(hrp, _)| hrp.as_str().to_owned())
}
