//! The immutable context every component is constructed with.
use crate::comm::Communicator;
use serde::{Deserialize, Serialize};

/// Cosmological parameters shared by the components of a job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cosmology {
    /// The dimensionless Hubble parameter
    pub h: f64,
    /// The matter density parameter
    pub omega_m: f64,
    /// The dark energy density parameter
    pub omega_lambda: f64,
}

impl Default for Cosmology {
    fn default() -> Self {
        Cosmology {
            h: 0.7,
            omega_m: 0.31,
            omega_lambda: 0.69,
        }
    }
}

/// The process group a component runs on and the optional cosmology it
/// uses. A `Context` is handed to constructors and never changes afterwards;
/// a worker group gets its own `Context` built around its sub-communicator.
#[derive(Debug, Clone)]
pub struct Context {
    comm: Communicator,
    cosmo: Option<Cosmology>,
}

impl Context {
    pub fn new(comm: Communicator) -> Self {
        Context { comm, cosmo: None }
    }

    /// A copy of this context that also carries `cosmo`
    pub fn with_cosmology(self, cosmo: Cosmology) -> Self {
        Context {
            cosmo: Some(cosmo),
            ..self
        }
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn cosmology(&self) -> Option<&Cosmology> {
        self.cosmo.as_ref()
    }

    /// A context for `comm` that keeps this context's cosmology
    pub(crate) fn for_comm(&self, comm: Communicator) -> Self {
        Context {
            comm,
            cosmo: self.cosmo,
        }
    }
}
