use std::io::Read;

/// Decodes a `.tar.zst` archive into `(path, content)` pairs in archive
/// order.
pub(crate) fn decode_archive(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let decoder = zstd::Decoder::new(archive).unwrap();
    let mut tar = tar::Archive::new(decoder);
    let mut out = Vec::new();
    for entry in tar.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        out.push((path, data));
    }
    out
}

/// Like [`decode_archive`] but sorted by path, for archives whose entry
/// order depends on fetch completion.
pub(crate) fn decode_archive_sorted(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut entries = decode_archive(archive);
    entries.sort();
    entries
}
