/// Anything that can be initialized with a `const` value.
///
/// Everything that sits inside a `#[global_allocator]` static has to be
/// constructible in a `const` context, so every backing memory and the
/// allocator itself implement this.
pub trait ConstInit {
    /// The `const` default initializer value for `Self`.
    const INIT: Self;
}

impl<T> ConstInit for Option<T> {
    const INIT: Self = None;
}
