//! Runtime invariant checks with a per-thread record of what was checked.
//!
//! Library code states its structural invariants with [`check_invariant!`].
//! A violation is logged and, in debug builds, panics. Tests can then
//! confirm a code path actually exercised the invariants they care about:
//!
//! ```rust,ignore
//! check_invariant!(
//!     registry.contains(&slot.device_id),
//!     "resolved slot device exists in registry",
//!     "registry::resolve_slots"
//! );
//!
//! // in a test, after driving the code path
//! crabstream::invariants::assert_checked("slot resolution", &[
//!     "resolved slot device exists in registry",
//! ]);
//! ```

use std::cell::RefCell;
use std::collections::HashSet;

thread_local! {
    static CHECKED: RefCell<HashSet<&'static str>> = RefCell::new(HashSet::new());
}

#[macro_export]
macro_rules! check_invariant {
    ($condition:expr, $name:expr) => {
        $crate::invariants::record($condition, $name, None)
    };
    ($condition:expr, $name:expr, $context:expr) => {
        $crate::invariants::record($condition, $name, Some($context))
    };
}

#[doc(hidden)]
pub fn record(holds: bool, name: &'static str, context: Option<&str>) {
    CHECKED.with(|checked| {
        checked.borrow_mut().insert(name);
    });

    if !holds {
        let context = context.unwrap_or("unknown");
        log::error!("Invariant violated [{}]: {}", context, name);
        debug_assert!(holds, "invariant violated [{}]: {}", context, name);
    }
}

/// Invariants checked on this thread since the last [`clear`].
pub fn checked() -> Vec<&'static str> {
    CHECKED.with(|checked| checked.borrow().iter().copied().collect())
}

/// Panics listing every required invariant that was never checked.
pub fn assert_checked(scenario: &str, required: &[&str]) {
    let seen = CHECKED.with(|checked| checked.borrow().clone());
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| !seen.contains(name))
        .collect();

    if !missing.is_empty() {
        panic!(
            "[{}] invariants never checked:\n  - {}",
            scenario,
            missing.join("\n  - ")
        );
    }
}

pub fn clear() {
    CHECKED.with(|checked| checked.borrow_mut().clear());
}
