//! Training progress display: a progress bar with the `progress-bar`
//! feature, periodic log lines otherwise.

#[cfg(not(feature = "progress-bar"))]
use log::info;

/// Log-line interval when no bar is drawn.
#[cfg(not(feature = "progress-bar"))]
const LOG_EVERY: usize = 10;

pub struct TrainingProgress {
    #[cfg(feature = "progress-bar")]
    bar: indicatif::ProgressBar,
    #[cfg(not(feature = "progress-bar"))]
    total: usize,
}

impl TrainingProgress {
    pub fn new(total: usize) -> Self {
        #[cfg(feature = "progress-bar")]
        {
            let bar = indicatif::ProgressBar::new(total as u64);
            if let Ok(style) = indicatif::ProgressStyle::default_bar()
                .template("{bar:40.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")
            {
                bar.set_style(style);
            }
            Self { bar }
        }
        #[cfg(not(feature = "progress-bar"))]
        {
            Self { total }
        }
    }

    /// Record a finished step; `loss` is `None` for a skipped update.
    pub fn step(&self, step: usize, loss: Option<f32>) {
        let msg = match loss {
            Some(loss) => format!("loss {:.4}", loss),
            None => "skipped".to_string(),
        };
        #[cfg(feature = "progress-bar")]
        {
            self.bar.set_position(step as u64);
            self.bar.set_message(msg);
        }
        #[cfg(not(feature = "progress-bar"))]
        {
            if step % LOG_EVERY == 0 || step == self.total {
                info!("Step {}/{}: {}", step, self.total, msg);
            }
        }
    }

    /// Print a line without tearing the bar.
    pub fn println(&self, line: &str) {
        #[cfg(feature = "progress-bar")]
        self.bar.println(line);
        #[cfg(not(feature = "progress-bar"))]
        info!("{}", line);
    }

    pub fn finish(&self) {
        #[cfg(feature = "progress-bar")]
        self.bar.finish_with_message("done");
    }
}
