//! PCM sample helpers.
//!
//! Format conversion between f32 and signed integer PCM, sample-rate and
//! channel-layout conversion for interleaved buffers, and level metering.

/// Convert i16 PCM samples to f32 (range -1.0 .. 1.0).
pub fn pcm_i16_to_f32(input: &[i16]) -> Vec<f32> {
    input.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert f32 PCM samples to i16.
pub fn pcm_f32_to_i16(input: &[f32]) -> Vec<i16> {
    input
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Rescale one integer sample of `bits` width to 16 bits.
///
/// 8-bit WAV data is unsigned on disk but `hound` already recentres it, so
/// every width arrives here as a signed value.
pub fn int_sample_to_i16(sample: i32, bits: u16) -> i16 {
    match bits {
        0..=16 => (sample << (16 - bits.max(1))) as i16,
        _ => (sample >> (bits.min(32) - 16)) as i16,
    }
}

/// Serialize samples as little-endian s16 bytes.
pub fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Compute RMS (root mean square) level of an f32 PCM buffer.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Convert the channel layout of an interleaved buffer.
///
/// Downmixing averages all input channels; upmixing from mono duplicates
/// the signal; any other upmix repeats the last input channel.
pub fn convert_channels(input: &[i16], from: u16, to: u16) -> Vec<i16> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return input.to_vec();
    }
    let frames = input.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in input.chunks_exact(from) {
        if to == 1 {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            out.push((sum / from as i32) as i16);
        } else {
            for ch in 0..to {
                out.push(frame[ch.min(from - 1)]);
            }
        }
    }
    out
}

/// Linear-interpolation resample of an interleaved buffer.
pub fn resample_linear(input: &[i16], channels: u16, from_rate: u32, to_rate: u32) -> Vec<i16> {
    let channels = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let in_frames = input.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;

    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let i0 = (pos.floor() as usize).min(in_frames - 1);
        let i1 = (i0 + 1).min(in_frames - 1);
        let frac = pos - i0 as f64;
        for ch in 0..channels {
            let a = input[i0 * channels + ch] as f64;
            let b = input[i1 * channels + ch] as f64;
            out.push((a + (b - a) * frac).round() as i16);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_f32_conversion_is_bounded() {
        let f = pcm_i16_to_f32(&[i16::MIN, 0, i16::MAX]);
        assert_eq!(f[0], -1.0);
        assert_eq!(f[1], 0.0);
        assert!(f[2] < 1.0);

        let back = pcm_f32_to_i16(&[-2.0, 0.5, 2.0]);
        assert_eq!(back, vec![-32768, 16383, 32767]);
    }

    #[test]
    fn sample_width_rescaling() {
        assert_eq!(int_sample_to_i16(-128, 8), i16::MIN);
        assert_eq!(int_sample_to_i16(127, 8), 127 << 8);
        assert_eq!(int_sample_to_i16(1234, 16), 1234);
        assert_eq!(int_sample_to_i16(0x7F_FF00, 24), 0x7FFF);
        assert_eq!(int_sample_to_i16(i32::MIN, 32), i16::MIN);
    }

    #[test]
    fn le_bytes_layout() {
        assert_eq!(i16_to_le_bytes(&[1, -1]), vec![0x01, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn rms_of_constant_signal() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn stereo_to_mono_averages() {
        assert_eq!(convert_channels(&[100, 300, -200, 0], 2, 1), vec![200, -100]);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        assert_eq!(convert_channels(&[1, 2], 1, 2), vec![1, 1, 2, 2]);
    }

    #[test]
    fn resample_changes_frame_count() {
        let input: Vec<i16> = (0..100).collect();
        let up = resample_linear(&input, 1, 8000, 16000);
        assert_eq!(up.len(), 200);
        assert_eq!(up[0], 0);
        assert_eq!(up[2], 1);

        let stereo = vec![0i16; 2 * 441];
        assert_eq!(resample_linear(&stereo, 2, 44100, 22050).len(), 2 * 220);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input = vec![5i16, 6, 7];
        assert_eq!(resample_linear(&input, 1, 24000, 24000), input);
    }
}
