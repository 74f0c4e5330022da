/// Tail of a full schedule consumed when starting from an image noised to `strength`.
///
/// Returns the consumed timesteps and the number of denoising steps they represent. With
/// `strength == 0` the tail is empty and no denoising happens.
pub fn strength_schedule(
    timesteps: &[f64],
    num_inference_steps: usize,
    strength: f64,
    order: usize,
) -> (Vec<f64>, usize) {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let init_timestep =
        ((num_inference_steps as f64 * strength).round() as usize).min(num_inference_steps);
    let t_start = num_inference_steps.saturating_sub(init_timestep);
    let tail = timesteps.get(t_start * order..).unwrap_or_default().to_vec();
    (tail, num_inference_steps - t_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(n: usize) -> Vec<f64> {
        (0..n).rev().map(|t| t as f64 * 20.).collect()
    }

    #[test]
    fn full_strength_keeps_every_step() {
        let (tail, steps) = strength_schedule(&schedule(50), 50, 1.0, 1);
        assert_eq!(steps, 50);
        assert_eq!(tail, schedule(50));
    }

    #[test]
    fn zero_strength_runs_nothing() {
        let (tail, steps) = strength_schedule(&schedule(50), 50, 0.0, 1);
        assert_eq!(steps, 0);
        assert!(tail.is_empty());
    }

    #[test]
    fn partial_strength_takes_the_tail() {
        let full = schedule(50);
        let (tail, steps) = strength_schedule(&full, 50, 0.8, 1);
        assert_eq!(steps, 40);
        assert_eq!(tail.as_slice(), &full[10..]);

        // 0.25 * 10 rounds to 3 steps.
        let (tail, steps) = strength_schedule(&schedule(10), 10, 0.25, 1);
        assert_eq!((tail.len(), steps), (3, 3));
    }

    #[test]
    fn every_strength_matches_the_step_count() {
        for steps in [1, 7, 25, 50] {
            for k in 0..=20 {
                let strength = f64::from(k) / 20.;
                let (tail, remaining) = strength_schedule(&schedule(steps), steps, strength, 1);
                let expected = ((steps as f64 * strength).round() as usize).min(steps);
                assert_eq!(remaining, expected);
                assert_eq!(tail.len(), remaining);
            }
        }
    }

    #[test]
    fn higher_order_schedules_skip_multiples() {
        // Two schedule entries per step.
        let full = schedule(20);
        let (tail, steps) = strength_schedule(&full, 10, 0.5, 2);
        assert_eq!(steps, 5);
        assert_eq!(tail.as_slice(), &full[10..]);
    }
}
