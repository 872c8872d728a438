/// Streaming linear resampler state; carries the fractional position and
/// the last sample across chunks so consecutive calls join seamlessly.
#[derive(Default)]
pub struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

pub fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate || target_rate == 0 {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
            if i + 1 >= buf.len() {
                break;
            }
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

/// Average interleaved frames down to one channel.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_rates_pass_through() {
        let mut state = ResamplerState::default();
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 16_000, 16_000, &mut state), input);
    }

    #[test]
    fn downsampling_by_three_keeps_the_rate() {
        let mut state = ResamplerState::default();
        let mut produced = 0;
        for _ in 0..10 {
            let chunk = vec![0.25f32; 480];
            produced += resample_linear(&chunk, 48_000, 16_000, &mut state).len();
        }
        // 4800 input samples at 3:1, give or take the carried sample.
        assert!((1599..=1601).contains(&produced), "produced {}", produced);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
    }
}
