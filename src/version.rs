const VERSION_WITH_GIT: &str = concat!(
    env!("PTYRELAY_VERSION_LABEL"),
    " (git ",
    env!("PTYRELAY_GIT_SHA"),
    ", built ",
    env!("PTYRELAY_BUILD_TIME"),
    ")",
);
const VERSION_NO_GIT: &str = concat!(
    env!("PTYRELAY_VERSION_LABEL"),
    " (built ",
    env!("PTYRELAY_BUILD_TIME"),
    ")",
);

pub const VERSION: &str = if env!("PTYRELAY_GIT_SHA").is_empty() {
    VERSION_NO_GIT
} else {
    VERSION_WITH_GIT
};
