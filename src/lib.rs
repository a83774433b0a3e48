//! Build service that turns uploaded Node.js bundles into container images and
//! pushes them to a registry.
//!
//! Each `PUT /v1/buildnodejs/{org}/{env}/{app}` runs one [`pipeline::Pipeline`]:
//! the zip upload is streamed to disk under a size limit, extracted, checked for
//! a `package.json` with a start script, built with the configured container CLI
//! and pushed. Every temporary file is removed once the request reaches its
//! outcome, whatever that outcome is.

pub mod backend;
pub mod cli;
pub mod pipeline;
pub mod server;
