//! Small shared helpers

/// Run `body` against `state`, then unconditionally run `restore`.
///
/// Scoped-override helper for hardware settings that must be put back on
/// every exit path: the measurement routines temporarily raise motor
/// currents and disable input shaping, and must restore them whether the
/// measurement succeeds, fails or is cancelled. A `Drop` guard cannot hold
/// `&mut` to the machine while the body also uses it, so the override is
/// expressed as a closure wrapper instead: early `return`/`?` inside `body`
/// still passes through the restore step.
pub fn restore_after<S, T>(
    state: &mut S,
    body: impl FnOnce(&mut S) -> T,
    restore: impl FnOnce(&mut S),
) -> T {
    let out = body(state);
    restore(state);
    out
}
