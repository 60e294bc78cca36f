use std::io::{self, Read, Write};

/// Header of every diff stream.
pub const BSDIFF_MAGIC: &[u8; 16] = b"ENDSLEY/BSDIFF43";

const COPY_BUFFER: usize = 64 * 1024;

/// Decode an 8-byte sign-magnitude little-endian integer.
pub fn offtin(buf: [u8; 8]) -> i64 {
    let magnitude = i64::from_le_bytes([
        buf[0],
        buf[1],
        buf[2],
        buf[3],
        buf[4],
        buf[5],
        buf[6],
        buf[7] & 0x7f,
    ]);
    if buf[7] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Encode an integer in the sign-magnitude layout read by [`offtin`].
pub fn offtout(value: i64) -> [u8; 8] {
    let mut buf = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        buf[7] |= 0x80;
    }
    buf
}

fn corrupt(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_int<R: Read>(patch: &mut R, what: &str) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    patch.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => corrupt(format!("diff stream ends inside {what}")),
        _ => e,
    })?;
    Ok(offtin(buf))
}

fn read_len<R: Read>(patch: &mut R, what: &str) -> io::Result<u64> {
    let value = read_int(patch, what)?;
    u64::try_from(value).map_err(|_| corrupt(format!("negative {what}: {value}")))
}

/// Reconstruct the new file from `old` and a diff stream, writing it to `out`.
///
/// Returns the number of bytes written. Any structural problem with the
/// stream is reported as `InvalidData`.
pub fn apply_patch<R: Read, W: Write>(old: &[u8], mut patch: R, mut out: W) -> io::Result<u64> {
    let mut magic = [0u8; 16];
    patch
        .read_exact(&mut magic)
        .map_err(|_| corrupt("diff stream is too short for its header"))?;
    if &magic != BSDIFF_MAGIC {
        return Err(corrupt("diff stream has an unknown header"));
    }
    let new_size = read_len(&mut patch, "new size")?;

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut written: u64 = 0;
    let mut old_pos: i64 = 0;

    while written < new_size {
        let add_len = read_len(&mut patch, "add length")?;
        let extra_len = read_len(&mut patch, "extra length")?;
        let seek = read_int(&mut patch, "seek")?;

        let end = written
            .checked_add(add_len)
            .and_then(|n| n.checked_add(extra_len))
            .ok_or_else(|| corrupt("diff lengths overflow"))?;
        if end > new_size {
            return Err(corrupt("diff writes past the declared size"));
        }
        let add_end = old_pos
            .checked_add(add_len as i64)
            .ok_or_else(|| corrupt("old cursor overflow"))?;
        if old_pos < 0 || add_end as u64 > old.len() as u64 {
            return Err(corrupt(format!(
                "diff reads old bytes {old_pos}..{add_end} of {}",
                old.len()
            )));
        }

        let mut remaining = add_len as usize;
        let mut cursor = old_pos as usize;
        while remaining > 0 {
            let n = remaining.min(buf.len());
            patch
                .read_exact(&mut buf[..n])
                .map_err(|_| corrupt("diff stream ends inside add bytes"))?;
            for (delta, base) in buf[..n].iter_mut().zip(&old[cursor..cursor + n]) {
                *delta = delta.wrapping_add(*base);
            }
            out.write_all(&buf[..n])?;
            remaining -= n;
            cursor += n;
        }

        let mut remaining = extra_len as usize;
        while remaining > 0 {
            let n = remaining.min(buf.len());
            patch
                .read_exact(&mut buf[..n])
                .map_err(|_| corrupt("diff stream ends inside extra bytes"))?;
            out.write_all(&buf[..n])?;
            remaining -= n;
        }

        written = end;
        old_pos = add_end
            .checked_add(seek)
            .ok_or_else(|| corrupt("old cursor overflow"))?;
    }

    if written != new_size {
        return Err(corrupt(format!(
            "diff produced {written} bytes, expected {new_size}"
        )));
    }
    out.flush()?;
    Ok(written)
}
