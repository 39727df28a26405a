//! Resilient model-call layer.
//!
//! Layered outermost-first: the cross-provider [`router`], the per-provider
//! [`resilient`] client (model fallback chain, credential rotation), the
//! [`retry`] schedule with jitter, and the per-provider circuit [`breaker`].
//! Every terminal call lands in the [`usage`] ledger, which also enforces
//! daily/monthly budgets.

pub mod breaker;
pub mod provider;
pub mod resilient;
pub mod retry;
pub mod router;
pub mod usage;
