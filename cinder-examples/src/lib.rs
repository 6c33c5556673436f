//! Example programs for cinder. See `examples/`.
