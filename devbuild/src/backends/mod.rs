mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerBackend;
