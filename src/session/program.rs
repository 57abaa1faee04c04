//! Program compilation and the per-session program cache.

use super::{ProgramKey, Session};
use crate::error::{Error, Result};
use crate::real::{self, REAL_BYTES, REAL_BYTES_CONSTANT};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError};

/// One compute entry point of a compiled program.
#[derive(Debug, Clone)]
pub struct Kernel {
    name: Arc<str>,
    pipeline: Arc<wgpu::ComputePipeline>,
}

impl Kernel {
    /// Entry-point name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }
}

/// A compiled kernel program: one pipeline per requested entry point.
#[derive(Debug)]
pub struct Program {
    identity: String,
    kernels: HashMap<String, Kernel>,
}

impl Program {
    /// Identity the program was built for.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Looks up an entry point.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the program was not built with that entry point.
    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        self.kernels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}::{name}", self.identity)))
    }
}

fn digest(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

impl Session {
    /// Compiles `source` for `identity`, creating one pipeline per entry point.
    ///
    /// The precision header is prepended and `REAL_BYTES` is supplied as a
    /// pipeline constant. Diagnostics at warning level fail the build. Results
    /// are cached per session by identity, the composed text and the set of
    /// entry points, so rebuilding the same composition is free.
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] on a disabled session, [`Error::Build`] with the
    /// full diagnostic log if compilation fails.
    pub fn compile_program(
        &self,
        identity: &str,
        source: &str,
        entry_points: &[&str],
    ) -> Result<Arc<Program>> {
        let gpu = self.require_gpu()?;
        let composed = format!("{}{}", real::precision_header(), source);
        let mut names: Vec<String> = entry_points.iter().map(|e| (*e).to_string()).collect();
        names.sort_unstable();
        names.dedup();
        let key = ProgramKey {
            identity: identity.to_string(),
            digest: digest(&composed),
            entry_points: names,
        };

        if let Some(program) = self
            .inner
            .programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(program));
        }

        let device = &gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(identity),
            source: wgpu::ShaderSource::Wgsl(composed.as_str().into()),
        });

        let mut log = String::new();
        let mut failed = false;
        let info = pollster::block_on(module.get_compilation_info());
        for message in &info.messages {
            match message.message_type {
                wgpu::CompilationMessageType::Error | wgpu::CompilationMessageType::Warning => {
                    failed = true;
                }
                wgpu::CompilationMessageType::Info => {}
            }
            let _ = writeln!(log, "{:?}: {}", message.message_type, message.message);
        }

        let mut kernels = HashMap::new();
        if !failed {
            #[allow(clippy::cast_precision_loss)]
            let constants = [(REAL_BYTES_CONSTANT, REAL_BYTES as f64)];
            for entry in entry_points {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(*entry),
                    layout: None,
                    module: &module,
                    entry_point: Some(*entry),
                    compilation_options: wgpu::PipelineCompilationOptions {
                        constants: &constants,
                        zero_initialize_workgroup_memory: true,
                    },
                    cache: None,
                });
                kernels.insert(
                    (*entry).to_string(),
                    Kernel {
                        name: Arc::from(*entry),
                        pipeline: Arc::new(pipeline),
                    },
                );
            }
        }

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            failed = true;
            let _ = writeln!(log, "{error}");
        }

        if failed {
            tracing::error!(identity, "kernel build failed:\n{log}");
            return Err(Error::Build {
                identity: identity.to_string(),
                log,
            });
        }

        let program = Arc::new(Program {
            identity: identity.to_string(),
            kernels,
        });
        tracing::debug!(identity, entry_points = entry_points.len(), "program compiled");

        self.inner
            .programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&program));
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_separates_compositions() {
        assert_eq!(digest("fn a() {}"), digest("fn a() {}"));
        assert_ne!(digest("fn a() {}"), digest("fn b() {}"));
    }

    #[test]
    fn disabled_session_cannot_compile() {
        let session = Session::disabled();
        assert!(matches!(
            session.compile_program("Linear", "fn f() {}", &["f"]),
            Err(Error::Precondition(_))
        ));
    }
}
