pub mod model_dir;

pub use model_dir::SdModelSource;
