use indicatif::{ProgressBar, ProgressIterator, ProgressStyle};

/// Wraps a sized iterator so that iterating it drives a progress bar: `NiceProgressBar::<_, 'g'>(iter, "Loading")`.
pub struct NiceProgressBar<'a, T: ExactSizeIterator, const COLOR: char = 'b'>(pub T, pub &'a str);

fn style<const COLOR: char>() -> ProgressStyle {
    let color = match COLOR {
        'g' => "green",
        'r' => "red",
        _ => "blue",
    };
    ProgressStyle::default_bar()
        .template(&format!(
            "{{msg}} [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// A bar advanced explicitly with [`ProgressBar::inc`], for loops where the number of visible
/// updates differs from the number of iterations. Hidden when `silent`.
pub fn manual_progress_bar(total: usize, msg: &str, silent: bool) -> ProgressBar {
    if silent {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total as u64);
    bar.set_style(style::<'g'>());
    bar.set_message(msg.to_string());
    bar
}

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<'_, T, COLOR> {
    type IntoIter = indicatif::ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let bar = ProgressBar::new(self.0.len() as u64);
        bar.set_style(style::<COLOR>());
        bar.set_message(self.1.to_string());
        self.0.progress_with(bar)
    }
}
