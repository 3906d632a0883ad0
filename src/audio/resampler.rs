//! 16 kHz → 24 kHz linear-interpolation resampler (3:2 ratio), §4.B.
//!
//! Input and output are mono signed 16-bit PCM. Samples are consumed in
//! non-overlapping pairs; each pair of inputs produces three outputs so the
//! ratio holds exactly for even-length buffers, which is the only shape the
//! rest of the crate ever hands it (10 ms frames at 16 kHz are 160 samples).

/// Upsample a 16 kHz PCM16 buffer to 24 kHz.
///
/// For each input pair `(a, b)` this emits `a`, an interpolated sample
/// weighted two-thirds toward `b`, and a third sample. The third sample is
/// the simple average `(a + b) / 2` for every pair except the very last,
/// where `b` itself is copied through unchanged so the final input sample
/// is always preserved exactly, not just approximated by an average.
pub fn upsample_16k_to_24k(input: &[i16]) -> Vec<i16> {
    let n = input.len();
    if n == 0 {
        return Vec::new();
    }

    let pairs = n / 2;
    let mut out = Vec::with_capacity(3 * pairs + if n % 2 == 1 { 1 } else { 0 });

    for k in 0..pairs {
        let a = input[2 * k];
        let b = input[2 * k + 1];
        let is_last_pair = k == pairs - 1 && n % 2 == 0;

        out.push(a);
        out.push(round_div(a as i32 + 2 * b as i32, 3) as i16);
        if is_last_pair {
            out.push(b);
        } else {
            out.push(round_div(a as i32 + b as i32, 2) as i16);
        }
    }

    if n % 2 == 1 {
        out.push(input[n - 1]);
    }

    out
}

/// Integer division rounded to the nearest value, ties away from zero.
fn round_div(num: i32, den: i32) -> i32 {
    if num >= 0 {
        (num + den / 2) / den
    } else {
        -((-num + den / 2) / den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(upsample_16k_to_24k(&[]).is_empty());
    }

    #[test]
    fn even_length_buffer_has_exactly_three_halves_the_length() {
        let input: Vec<i16> = (0..160).map(|i| (i * 10) as i16).collect();
        let out = upsample_16k_to_24k(&input);
        assert_eq!(out.len(), input.len() * 3 / 2);
    }

    #[test]
    fn first_and_last_samples_are_preserved_exactly() {
        let input = [100i16, 200, -300, 400, 500, -600];
        let out = upsample_16k_to_24k(&input);
        assert_eq!(out.first().copied(), input.first().copied());
        assert_eq!(out.last().copied(), input.last().copied());
    }

    #[test]
    fn peak_amplitude_does_not_overflow() {
        let input = [i16::MAX, i16::MIN, i16::MAX, i16::MIN];
        let out = upsample_16k_to_24k(&input);
        assert_eq!(out.len(), 6);
        for sample in out {
            assert!(sample >= i16::MIN && sample <= i16::MAX);
        }
    }

    #[test]
    fn odd_length_buffer_copies_the_unpaired_tail_sample() {
        let input = [10i16, 20, 30];
        let out = upsample_16k_to_24k(&input);
        // one full pair (10, 20) -> 3 samples, plus the unpaired tail.
        assert_eq!(out.len(), 4);
        assert_eq!(out[3], 30);
    }

    #[test]
    fn constant_signal_resamples_to_the_same_constant() {
        let input = vec![1234i16; 160];
        let out = upsample_16k_to_24k(&input);
        assert!(out.iter().all(|&s| s == 1234));
    }
}
