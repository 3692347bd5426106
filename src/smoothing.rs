/// Moving-average smoothing applied to a block before the transform
///
/// Each output sample is the mean of the input over `[i - w, i + w]`, with the
/// window clamped at the block edges rather than wrapped around.

/// Default half-window of the moving average
pub const DEFAULT_HALF_WINDOW: usize = 2;

/// Centered moving average of `input` written into `output`.
///
/// Uses a running sum, so the cost is linear in the block length regardless of
/// the window size.
///
/// # Panics
/// If `output` is shorter than `input`.
pub fn moving_average(input: &[i16], half_window: usize, output: &mut [f64]) {
    assert!(
        output.len() >= input.len(),
        "smoothing output holds {} samples, input has {}",
        output.len(),
        input.len()
    );

    let len = input.len();
    if len == 0 {
        return;
    }

    // Window for index 0 is [0, min(len - 1, w)]
    let mut start = 0usize;
    let mut end = half_window.min(len - 1);
    let mut sum: i64 = input[start..=end].iter().map(|&s| s as i64).sum();

    for (i, out) in output.iter_mut().take(len).enumerate() {
        let want_start = i.saturating_sub(half_window);
        let want_end = (i + half_window).min(len - 1);

        while end < want_end {
            end += 1;
            sum += input[end] as i64;
        }
        while start < want_start {
            sum -= input[start] as i64;
            start += 1;
        }

        *out = sum as f64 / (end - start + 1) as f64;
    }
}
