//! Partial message reassembly.
//!
//! Provider notifications larger than the transport's message limit arrive
//! split across several deliveries. The producer gzips the whole JSON body,
//! slices the compressed bytes into pages, and stamps every page with the
//! SHA-256 of the compressed whole. Pages arrive in any order, possibly more
//! than once; this module collects them and hands back the inflated body
//! once the set is complete.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use thiserror::Error;

use crate::store::{Fragment, FragmentStore, StoreError};

/// What became of an incoming fragment.
#[derive(Debug)]
pub enum ReassemblyOutcome {
    /// The set is complete; this is the decompressed notification body.
    Complete(Vec<u8>),
    /// More pages are still in flight.
    Pending { have: u64, want: u64 },
}

#[derive(Debug, Error)]
pub enum ReassemblyError {
    /// The pages concatenate to something other than what the producer
    /// hashed. Retrying with the same set cannot succeed.
    #[error("reassembled payload hash {actual} does not match checksum {expected}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("reassembled payload is not valid gzip data: {0}")]
    Decompress(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Records one page and reports whether the set completed.
///
/// Completion is checked twice: before storing, so that when every sibling
/// page is already in, reconstruction runs with the incoming page spliced in
/// rather than waiting on its own write, and after storing, the common case
/// where this page's insert brings the count to the total.
pub async fn add_fragment(
    store: &dyn FragmentStore,
    fragment: Fragment,
) -> Result<ReassemblyOutcome, ReassemblyError> {
    let want = u64::from(fragment.page_total);

    let have = store.count_fragments(&fragment.checksum).await?;
    if have + 1 >= want {
        return reconstruct(store, fragment)
            .await
            .map(ReassemblyOutcome::Complete);
    }

    let have = store.put_fragment(&fragment).await?;
    if have >= want {
        return reconstruct(store, fragment)
            .await
            .map(ReassemblyOutcome::Complete);
    }

    Ok(ReassemblyOutcome::Pending { have, want })
}

async fn reconstruct(
    store: &dyn FragmentStore,
    current: Fragment,
) -> Result<Vec<u8>, ReassemblyError> {
    let checksum = current.checksum.clone();

    // The triggering page may not be stored under its own key yet, so it is
    // spliced in over whatever came back.
    let mut pages: BTreeMap<u32, Vec<u8>> = store
        .get_fragments(&checksum)
        .await?
        .into_iter()
        .map(|f| (f.page_number, f.payload))
        .collect();
    pages.insert(current.page_number, current.payload);

    let compressed: Vec<u8> = pages.into_values().flatten().collect();
    let actual = hex::encode(Sha256::digest(&compressed));
    if actual != checksum {
        return Err(ReassemblyError::ChecksumMismatch {
            expected: checksum,
            actual,
        });
    }

    let mut body = Vec::new();
    GzDecoder::new(&compressed[..]).read_to_end(&mut body)?;

    // Leftover rows only waste space, so a failed delete is not worth
    // failing the build over.
    if let Err(error) = store.delete_fragments(&checksum).await {
        tracing::warn!(%checksum, %error, "could not delete reassembled fragments");
    }

    Ok(body)
}

/// Producer side of the fragment format: gzip the whole body, slice the
/// compressed bytes into pages of at most `max_bytes`, and stamp every page
/// with the hash of the compressed whole.
pub fn split_into_fragments(body: &[u8], max_bytes: usize) -> std::io::Result<Vec<Fragment>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    let compressed = encoder.finish()?;

    let checksum = hex::encode(Sha256::digest(&compressed));
    let chunks: Vec<&[u8]> = compressed.chunks(max_bytes.max(1)).collect();
    let page_total = chunks.len() as u32;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Fragment {
            checksum: checksum.clone(),
            page_number: index as u32 + 1,
            page_total,
            payload: chunk.to_vec(),
        })
        .collect())
}
