use std::collections::HashMap;
use std::io::{self, Write};

use crate::binary_patch::{offtout, BSDIFF_MAGIC};
use crate::rolling_hash::Adler32Window;

pub const BLOCK_SIZE: usize = 4096;

/// One step of reconstructing the new file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffChunk {
    /// Reuse `length` bytes of the old file starting at `offset`.
    Copy { offset: u64, length: u64 },
    /// Bytes that do not occur in the old file.
    Insert { data: Vec<u8> },
}

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: u64,
}

/// Compute a diff between `old` and `new` as copy/insert chunks.
///
/// Old data is cut into fixed blocks indexed by a weak rolling checksum and a
/// BLAKE3 strong hash; new data is scanned with a sliding window and every
/// window that matches an old block becomes a copy.
pub fn compute_diff(old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
    if new.is_empty() {
        return vec![];
    }
    if old.is_empty() || new.len() < BLOCK_SIZE {
        return vec![DiffChunk::Insert { data: new.to_vec() }];
    }

    let signatures = build_signatures(old);
    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.weak).or_default().push(idx);
    }

    match_blocks(old, new, &table, &signatures)
}

fn build_signatures(data: &[u8]) -> Vec<BlockSignature> {
    data.chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, block)| BlockSignature {
            weak: Adler32Window::over(block).value(),
            strong: blake3::hash(block),
            offset: (i * BLOCK_SIZE) as u64,
        })
        .collect()
}

fn match_blocks(
    old: &[u8],
    new: &[u8],
    table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Vec<DiffChunk> {
    let mut chunks = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut window = Adler32Window::over(&new[..BLOCK_SIZE]);
    let mut pos = 0usize;

    while pos + BLOCK_SIZE <= new.len() {
        let found = table.get(&window.value()).and_then(|candidates| {
            let strong = blake3::hash(&new[pos..pos + BLOCK_SIZE]);
            candidates
                .iter()
                .map(|&idx| &signatures[idx])
                .find(|sig| sig.strong == strong)
        });

        match found {
            // Only full-length old blocks can match a full-length window.
            Some(sig) if sig.offset as usize + BLOCK_SIZE <= old.len() => {
                if !pending.is_empty() {
                    chunks.push(DiffChunk::Insert {
                        data: std::mem::take(&mut pending),
                    });
                }
                push_copy(&mut chunks, sig.offset, BLOCK_SIZE as u64);
                pos += BLOCK_SIZE;
                if pos + BLOCK_SIZE <= new.len() {
                    window = Adler32Window::over(&new[pos..pos + BLOCK_SIZE]);
                }
            }
            _ => {
                pending.push(new[pos]);
                pos += 1;
                if pos + BLOCK_SIZE <= new.len() {
                    window.roll(new[pos - 1], new[pos + BLOCK_SIZE - 1]);
                }
            }
        }
    }

    pending.extend_from_slice(&new[pos..]);
    if !pending.is_empty() {
        chunks.push(DiffChunk::Insert { data: pending });
    }
    chunks
}

/// Extend the previous copy when it is contiguous in the old file.
fn push_copy(chunks: &mut Vec<DiffChunk>, offset: u64, length: u64) {
    if let Some(DiffChunk::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = chunks.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    chunks.push(DiffChunk::Copy { offset, length });
}

struct Control {
    add_len: u64,
    extra: Vec<u8>,
    seek: i64,
}

/// Serialize chunks as a bsdiff-style stream that [`crate::binary_patch::apply_patch`]
/// turns back into the new file. Copies become zero-delta add runs, inserts
/// become extra bytes.
pub fn write_patch<W: Write>(chunks: &[DiffChunk], mut out: W) -> io::Result<()> {
    let new_size: u64 = chunks
        .iter()
        .map(|c| match c {
            DiffChunk::Copy { length, .. } => *length,
            DiffChunk::Insert { data } => data.len() as u64,
        })
        .sum();

    let mut controls: Vec<Control> = Vec::new();
    let mut current = Control {
        add_len: 0,
        extra: Vec::new(),
        seek: 0,
    };
    // Old offset where `current`'s add run starts.
    let mut run_start: i64 = 0;

    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let offset = *offset as i64;
                let cursor = run_start + current.add_len as i64;
                if current.extra.is_empty() && cursor == offset {
                    current.add_len += length;
                    continue;
                }
                current.seek = offset - cursor;
                controls.push(std::mem::replace(
                    &mut current,
                    Control {
                        add_len: *length,
                        extra: Vec::new(),
                        seek: 0,
                    },
                ));
                run_start = offset;
            }
            DiffChunk::Insert { data } => current.extra.extend_from_slice(data),
        }
    }
    if current.add_len > 0 || !current.extra.is_empty() {
        controls.push(current);
    }

    out.write_all(BSDIFF_MAGIC)?;
    out.write_all(&offtout(new_size as i64))?;
    let zeros = vec![0u8; BLOCK_SIZE];
    for control in &controls {
        out.write_all(&offtout(control.add_len as i64))?;
        out.write_all(&offtout(control.extra.len() as i64))?;
        out.write_all(&offtout(control.seek))?;
        let mut remaining = control.add_len as usize;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            out.write_all(&zeros[..n])?;
            remaining -= n;
        }
        out.write_all(&control.extra)?;
    }
    out.flush()
}

/// Diff `old` against `new` and return the encoded stream.
pub fn diff_to_vec(old: &[u8], new: &[u8]) -> Vec<u8> {
    let chunks = compute_diff(old, new);
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_patch(&chunks, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_patch::apply_patch;

    fn round_trip(old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
        let chunks = compute_diff(old, new);
        let mut stream = Vec::new();
        write_patch(&chunks, &mut stream).unwrap();
        let mut rebuilt = Vec::new();
        apply_patch(old, &stream[..], &mut rebuilt).unwrap();
        assert_eq!(rebuilt, new);
        chunks
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn identical_data_is_one_copy() {
        let data = patterned(BLOCK_SIZE * 3);
        let chunks = round_trip(&data, &data);
        assert_eq!(
            chunks,
            vec![DiffChunk::Copy {
                offset: 0,
                length: (BLOCK_SIZE * 3) as u64
            }]
        );
    }

    #[test]
    fn completely_different() {
        round_trip(&vec![0u8; BLOCK_SIZE * 2], &vec![1u8; BLOCK_SIZE * 2]);
    }

    #[test]
    fn prefix_changed_reuses_tail() {
        let old = patterned(BLOCK_SIZE * 4);
        let mut new = old.clone();
        for b in new[..BLOCK_SIZE].iter_mut() {
            *b = 0xFF;
        }
        let chunks = round_trip(&old, &new);
        assert!(chunks.iter().any(|c| matches!(c, DiffChunk::Copy { .. })));
    }

    #[test]
    fn reordered_blocks_need_backward_seeks() {
        let old = patterned(BLOCK_SIZE * 3);
        let mut new = old[BLOCK_SIZE * 2..].to_vec();
        new.extend_from_slice(&old[..BLOCK_SIZE * 2]);
        let chunks = round_trip(&old, &new);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn empty_inputs() {
        round_trip(&[], &patterned(100));
        round_trip(&patterned(100), &[]);
        round_trip(&[], &[]);
    }

    #[test]
    fn small_files_are_inserted() {
        round_trip(b"Hello, World!", b"Hello, Rust!");
    }

    #[test]
    fn insertion_in_middle() {
        let old = patterned(BLOCK_SIZE * 4);
        let mut new = old.clone();
        let at = BLOCK_SIZE * 2;
        new.splice(at..at, vec![0xAA; 100]);
        let chunks = round_trip(&old, &new);
        let copied: u64 = chunks
            .iter()
            .map(|c| match c {
                DiffChunk::Copy { length, .. } => *length,
                DiffChunk::Insert { .. } => 0,
            })
            .sum();
        assert_eq!(copied, (BLOCK_SIZE * 4) as u64);
    }
}
