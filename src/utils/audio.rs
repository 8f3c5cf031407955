use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavInfo {
    pub byte_rate: u32,
    pub data_size: u32,
}

impl WavInfo {
    /// Playback length derived from the data chunk size and the byte rate.
    pub fn duration(&self) -> Duration {
        if self.byte_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.data_size as u128 * 1_000_000_000 / self.byte_rate as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// Reads the RIFF header of an in-memory WAV file.
pub fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);

    let mut id = [0u8; 4];
    f.read_exact(&mut id)
        .map_err(|_| anyhow!("Too short for a RIFF header"))?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    // Skip file size
    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id)
        .map_err(|_| anyhow!("Too short for a WAVE header"))?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt_content: Option<Vec<u8>> = None;
    let mut data_size: Option<u32> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)
                .map_err(|_| anyhow!("Truncated fmt chunk"))?;
            fmt_content = Some(buf);
        } else if &chunk_id == b"data" {
            // Streaming encoders may write a placeholder size; clamp to what is present.
            let remaining = bytes.len() as u64 - f.position();
            data_size = Some(chunk_size.min(remaining as u32));
            break;
        } else {
            // Chunks are word aligned
            let skip = chunk_size as i64 + (chunk_size % 2) as i64;
            f.seek(SeekFrom::Current(skip))?;
        }
    }

    let fmt = fmt_content.ok_or_else(|| anyhow!("Missing fmt chunk"))?;
    if fmt.len() < 16 {
        return Err(anyhow!("fmt chunk is {} bytes, expected at least 16", fmt.len()));
    }
    let data_size = data_size.ok_or_else(|| anyhow!("Missing data chunk"))?;

    Ok(WavInfo {
        byte_rate: u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]),
        data_size,
    })
}

/// Duration of an in-memory WAV file. Fails when the audio is malformed or silent-empty.
pub fn wav_duration(bytes: &[u8]) -> Result<Duration> {
    let info = scan_wav(bytes)?;
    if info.byte_rate == 0 {
        return Err(anyhow!("WAV byte rate is zero"));
    }
    let duration = info.duration();
    if duration.is_zero() {
        return Err(anyhow!("WAV contains no samples"));
    }
    Ok(duration)
}

#[cfg(test)]
pub(crate) fn create_dummy_wav(size: u32, sample_rate: u32) -> Vec<u8> {
    use std::io::Write;

    let mut buf = Vec::new();
    buf.write_all(b"RIFF").unwrap();
    let total_size = 36 + size;
    buf.write_all(&total_size.to_le_bytes()).unwrap();
    buf.write_all(b"WAVE").unwrap();

    buf.write_all(b"fmt ").unwrap();
    buf.write_all(&16u32.to_le_bytes()).unwrap();
    // PCM (1), Mono (1), SampleRate, ByteRate, BlockAlign (2), Bits (16)
    buf.write_all(&1u16.to_le_bytes()).unwrap();
    buf.write_all(&1u16.to_le_bytes()).unwrap();
    buf.write_all(&sample_rate.to_le_bytes()).unwrap();
    buf.write_all(&(sample_rate * 2).to_le_bytes()).unwrap();
    buf.write_all(&2u16.to_le_bytes()).unwrap();
    buf.write_all(&16u16.to_le_bytes()).unwrap();

    buf.write_all(b"data").unwrap();
    buf.write_all(&size.to_le_bytes()).unwrap();
    buf.write_all(&vec![0u8; size as usize]).unwrap();

    buf
}
