pub const FULL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+git.",
    env!("AUTONOMY_GIT_COUNT"),
    ".",
    env!("AUTONOMY_GIT_SHA"),
    env!("AUTONOMY_GIT_DIRTY")
);
