use std::{fmt, sync::Arc};

/// Shared callback that remembers where it was created, for debug output.
pub struct Callback<T, R> {
    cb: Arc<dyn Fn(T) -> R + 'static + Send + Sync>,
    #[cfg(debug_assertions)]
    origin: &'static std::panic::Location<'static>,
}
impl<T, R> Clone for Callback<T, R> {
    fn clone(&self) -> Self {
        Self {
            cb: self.cb.clone(),
            #[cfg(debug_assertions)]
            origin: self.origin,
        }
    }
}
impl<T, R> fmt::Debug for Callback<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_tuple("Callback");
        #[cfg(debug_assertions)]
        dbg.field(&format_args!("{}", self.origin));
        dbg.finish()
    }
}
impl<T, R> Callback<T, R> {
    #[inline]
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn from_fn(callback: impl Fn(T) -> R + 'static + Send + Sync) -> Self {
        Self {
            cb: Arc::new(callback),
            #[cfg(debug_assertions)]
            origin: std::panic::Location::caller(),
        }
    }

    #[inline]
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn from_fn_ctx<C: 'static + Send + Sync>(
        ctx: C,
        callback: impl Fn(&C, T) -> R + 'static + Send + Sync,
    ) -> Self {
        Self::from_fn(move |arg| callback(&ctx, arg))
    }

    pub fn call(&self, arg: T) -> R {
        (self.cb)(arg)
    }
}
impl<T, R> From<&Self> for Callback<T, R> {
    fn from(value: &Self) -> Self {
        value.clone()
    }
}
