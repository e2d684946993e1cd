pub mod error;
pub mod loaders;
pub mod models;
pub mod trainers;

// Re-export common types
pub use trainers::{load_config, train_from_config, ConceptTrainer, TrainConfig, TrainingSummary};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped log lines at info level. `RUST_LOG` overrides the level.
    pub fn init_logger() {
        let mut builder = Builder::new();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info);
        if let Ok(spec) = std::env::var("RUST_LOG") {
            builder.parse_filters(&spec);
        }
        // a second call (e.g. from tests) keeps the first logger
        let _ = builder.try_init();
    }
}
