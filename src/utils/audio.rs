use crate::services::gateway::SpeechAudio;
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

const BITS_PER_SAMPLE: u16 = 16;

/// Wraps 16-bit little-endian PCM in a canonical 44-byte-header WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let data_size = u32::try_from(pcm.len()).map_err(|_| anyhow!("PCM payload too large for WAV"))?;
    let block_align = channels * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * block_align as u32;

    let mut buf = Vec::with_capacity(44 + pcm.len());
    // RIFF [4] + Size [4] + WAVE [4]
    buf.write_all(b"RIFF")?;
    buf.write_all(&(36 + data_size).to_le_bytes())?;
    buf.write_all(b"WAVE")?;

    // fmt chunk: PCM (1), channels, rate, byte rate, block align, bits
    buf.write_all(b"fmt ")?;
    buf.write_all(&16u32.to_le_bytes())?;
    buf.write_all(&1u16.to_le_bytes())?;
    buf.write_all(&channels.to_le_bytes())?;
    buf.write_all(&sample_rate.to_le_bytes())?;
    buf.write_all(&byte_rate.to_le_bytes())?;
    buf.write_all(&block_align.to_le_bytes())?;
    buf.write_all(&BITS_PER_SAMPLE.to_le_bytes())?;

    buf.write_all(b"data")?;
    buf.write_all(&data_size.to_le_bytes())?;
    buf.write_all(pcm)?;
    Ok(buf)
}

pub async fn write_wav(path: &Path, audio: &SpeechAudio) -> Result<()> {
    let wav = pcm_to_wav(&audio.pcm, audio.sample_rate, audio.channels)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, wav)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}

/// Playback length of the clip.
pub fn duration_of(audio: &SpeechAudio) -> Duration {
    let bytes_per_second =
        audio.sample_rate as u64 * audio.channels as u64 * (BITS_PER_SAMPLE / 8) as u64;
    if bytes_per_second == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(audio.pcm.len() as u64 * 1000 / bytes_per_second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn le_u16(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
    }

    #[test]
    fn test_wav_header() -> Result<()> {
        let wav = pcm_to_wav(&[0u8; 10], 24_000, 1)?;
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(le_u32(&wav, 4), 46);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(le_u16(&wav, 22), 1);
        assert_eq!(le_u32(&wav, 24), 24_000);
        assert_eq!(le_u32(&wav, 28), 48_000);
        assert_eq!(le_u16(&wav, 32), 2);
        assert_eq!(le_u16(&wav, 34), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(le_u32(&wav, 40), 10);
        assert_eq!(wav.len(), 54);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_wav_creates_parent() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("audio").join("1-0.wav");
        let audio = SpeechAudio {
            pcm: vec![1, 2, 3, 4],
            sample_rate: 24_000,
            channels: 1,
        };
        write_wav(&path, &audio).await?;
        let written = std::fs::read(&path)?;
        assert_eq!(written.len(), 48);
        assert_eq!(&written[44..], &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_duration() {
        let audio = SpeechAudio {
            pcm: vec![0; 48_000],
            sample_rate: 24_000,
            channels: 1,
        };
        assert_eq!(duration_of(&audio), Duration::from_secs(1));
    }
}
