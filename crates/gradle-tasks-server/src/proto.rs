//! Code generated from `proto/gradle_tasks/v1/gradle_tasks.proto`.

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod v1 {
    tonic::include_proto!("gradle_tasks.v1");
}
