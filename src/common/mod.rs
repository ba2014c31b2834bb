pub(crate) mod async_util;
