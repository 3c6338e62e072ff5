//! WAV clip IO: probing, writing synthesis output, and concatenation.
//!
//! Everything written here is 16-bit integer PCM. Sources of any width
//! (8/16/24/32-bit int or 32-bit float) are rescaled on read.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result, bail};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{debug, warn};

use super::pcm::{
    convert_channels, i16_to_le_bytes, int_sample_to_i16, pcm_f32_to_i16, resample_linear,
};
use crate::tts::provider::SynthesisOutput;

/// Header facts about one WAV file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frames: u32,
}

impl WavInfo {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames as f64 / self.sample_rate as f64
    }

    /// Same rate and channel count (sample width is normalised anyway).
    pub fn compatible_with(&self, other: &WavInfo) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }
}

fn spec_16bit(sample_rate: u32, channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

pub fn probe(path: &Path) -> Result<WavInfo> {
    let reader =
        WavReader::open(path).with_context(|| format!("failed to open WAV {}", path.display()))?;
    let spec = reader.spec();
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        frames: reader.duration(),
    })
}

/// Read a WAV file as interleaved 16-bit samples.
pub fn read_i16(path: &Path) -> Result<(WavInfo, Vec<i16>)> {
    let reader =
        WavReader::open(path).with_context(|| format!("failed to open WAV {}", path.display()))?;
    let spec = reader.spec();
    let info = WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        frames: reader.duration(),
    };

    let samples = match spec.sample_format {
        SampleFormat::Float => {
            let floats = reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("corrupt WAV data in {}", path.display()))?;
            pcm_f32_to_i16(&floats)
        }
        SampleFormat::Int => reader
            .into_samples::<i32>()
            .map(|s| s.map(|v| int_sample_to_i16(v, spec.bits_per_sample)))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("corrupt WAV data in {}", path.display()))?,
    };
    Ok((info, samples))
}

/// Write synthesis output as a 16-bit WAV file.
pub fn write_output(path: &Path, output: &SynthesisOutput) -> Result<()> {
    write_i16(
        path,
        output.sample_rate,
        output.channels.max(1),
        &pcm_f32_to_i16(&output.samples),
    )
}

pub fn write_i16(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = WavWriter::new(BufWriter::new(file), spec_16bit(sample_rate, channels))
        .context("failed to write WAV header")?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer
        .finalize()
        .with_context(|| format!("failed to finalize {}", path.display()))?;
    Ok(())
}

/// Read a source and bring it to `target` rate and channel count.
///
/// Returns the samples and whether any conversion was needed.
pub fn read_normalized(path: &Path, target: &WavInfo) -> Result<(Vec<i16>, bool)> {
    let (info, mut samples) = read_i16(path)?;
    let mut converted = false;
    if info.channels != target.channels {
        samples = convert_channels(&samples, info.channels, target.channels);
        converted = true;
    }
    if info.sample_rate != target.sample_rate {
        samples = resample_linear(&samples, target.channels, info.sample_rate, target.sample_rate);
        converted = true;
    }
    Ok((samples, converted))
}

/// Samples per chunk yielded by [`S16leChunks`].
pub const CHUNK_SAMPLES: usize = 8192;

/// Streams a WAV file as little-endian s16 byte chunks, converting the
/// sample width on the fly.
pub struct S16leChunks {
    reader: WavReader<BufReader<File>>,
    spec: WavSpec,
    chunk_samples: usize,
    finished: bool,
}

impl S16leChunks {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_chunk_size(path, CHUNK_SAMPLES)
    }

    pub fn with_chunk_size(path: &Path, chunk_samples: usize) -> Result<Self> {
        let reader = WavReader::open(path)
            .with_context(|| format!("failed to open WAV {}", path.display()))?;
        let spec = reader.spec();
        Ok(Self {
            reader,
            spec,
            chunk_samples: chunk_samples.max(1),
            finished: false,
        })
    }

    fn next_samples(&mut self) -> hound::Result<Vec<i16>> {
        let n = self.chunk_samples;
        match self.spec.sample_format {
            SampleFormat::Float => self
                .reader
                .samples::<f32>()
                .take(n)
                .map(|s| s.map(|v| (v * 32767.0).clamp(-32768.0, 32767.0) as i16))
                .collect(),
            SampleFormat::Int => {
                let bits = self.spec.bits_per_sample;
                self.reader
                    .samples::<i32>()
                    .take(n)
                    .map(|s| s.map(|v| int_sample_to_i16(v, bits)))
                    .collect()
            }
        }
    }
}

impl Iterator for S16leChunks {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_samples() {
            Ok(samples) if samples.is_empty() => {
                self.finished = true;
                None
            }
            Ok(samples) => Some(Ok(i16_to_le_bytes(&samples))),
            Err(e) => {
                self.finished = true;
                Some(Err(anyhow::Error::new(e).context("corrupt WAV data")))
            }
        }
    }
}

/// Result of [`concat`].
#[derive(Debug, Clone, Copy)]
pub struct ConcatOutcome {
    pub info: WavInfo,
    /// True when at least one source had to be resampled or remixed.
    pub normalized: bool,
}

/// Concatenate `sources` in order into a single 16-bit WAV at `dest`.
///
/// The first source fixes the output rate and channel count; later sources
/// that differ are converted to it.
pub fn concat(sources: &[&Path], dest: &Path) -> Result<ConcatOutcome> {
    let Some(first) = sources.first() else {
        bail!("nothing to concatenate");
    };
    let target = probe(first)?;
    let spec = spec_16bit(target.sample_rate, target.channels);

    let file =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut writer =
        WavWriter::new(BufWriter::new(file), spec).context("failed to write WAV header")?;

    let mut normalized = false;
    let mut frames: u64 = 0;
    for source in sources {
        let (samples, converted) = read_normalized(source, &target)?;
        if converted {
            warn!(
                source = %source.display(),
                sample_rate = target.sample_rate,
                channels = target.channels,
                "converting clip to match preview format"
            );
            normalized = true;
        }
        frames += (samples.len() / target.channels.max(1) as usize) as u64;
        let mut chunk = writer.get_i16_writer(samples.len() as u32);
        for s in samples {
            chunk.write_sample(s);
        }
        chunk.flush()?;
    }
    writer
        .finalize()
        .with_context(|| format!("failed to finalize {}", dest.display()))?;

    debug!(dest = %dest.display(), sources = sources.len(), frames, "concatenated WAV clips");
    Ok(ConcatOutcome {
        info: WavInfo {
            bits_per_sample: 16,
            frames: frames as u32,
            ..target
        },
        normalized,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a constant-valued 16-bit test clip.
    pub(crate) fn tone(path: &Path, sample_rate: u32, channels: u16, frames: usize, value: i16) {
        let samples = vec![value; frames * channels as usize];
        write_i16(path, sample_rate, channels, &samples).unwrap();
    }

    #[test]
    fn probe_reports_header() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.wav");
        tone(&p, 24000, 1, 2400, 100);
        let info = probe(&p).unwrap();
        assert_eq!(info.sample_rate, 24000);
        assert_eq!(info.frames, 2400);
        assert!((info.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn write_output_round_trips_length() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("out.wav");
        write_output(&p, &SynthesisOutput::mono(vec![0.5; 441], 44100)).unwrap();
        let (info, samples) = read_i16(&p).unwrap();
        assert_eq!(info.bits_per_sample, 16);
        assert_eq!(samples.len(), 441);
        assert_eq!(samples[0], 16383);
    }

    #[test]
    fn reads_24bit_as_16bit() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("wide.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 24,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(&p, spec).unwrap();
        w.write_sample(0x10_0000i32).unwrap();
        w.finalize().unwrap();

        let (info, samples) = read_i16(&p).unwrap();
        assert_eq!(info.bits_per_sample, 24);
        assert_eq!(samples, vec![0x1000]);
    }

    #[test]
    fn concat_preserves_order_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        tone(&a, 16000, 1, 100, 1);
        tone(&b, 16000, 1, 50, 2);
        let out = dir.path().join("out.wav");

        let outcome = concat(&[&a, &b], &out).unwrap();
        assert!(!outcome.normalized);
        assert_eq!(outcome.info.frames, 150);

        let (_, samples) = read_i16(&out).unwrap();
        assert_eq!(samples[0], 1);
        assert_eq!(samples[99], 1);
        assert_eq!(samples[100], 2);
    }

    #[test]
    fn concat_normalizes_mismatched_sources() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        tone(&a, 22050, 1, 2205, 10);
        tone(&b, 44100, 2, 4410, 20);
        let out = dir.path().join("out.wav");

        let outcome = concat(&[&a, &b], &out).unwrap();
        assert!(outcome.normalized);
        let info = probe(&out).unwrap();
        assert_eq!(info.sample_rate, 22050);
        assert_eq!(info.channels, 1);
        assert_eq!(info.frames, 2205 * 2);
    }

    #[test]
    fn chunks_cover_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.wav");
        tone(&p, 8000, 2, 1000, -3);

        let chunks: Vec<Vec<u8>> = S16leChunks::with_chunk_size(&p, 300)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 7);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 2000 * 2);
        assert_eq!(&chunks[0][..2], &(-3i16).to_le_bytes());
    }

    #[test]
    fn float_chunks_are_converted() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut w = WavWriter::create(&p, spec).unwrap();
        w.write_sample(0.5f32).unwrap();
        w.write_sample(-1.0f32).unwrap();
        w.finalize().unwrap();

        let bytes: Vec<u8> = S16leChunks::open(&p).unwrap().next().unwrap().unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16383);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32767);
    }

    #[test]
    fn concat_of_nothing_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(concat(&[], &dir.path().join("x.wav")).is_err());
    }
}
