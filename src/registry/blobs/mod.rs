pub(crate) mod get;
pub(crate) mod head;
pub(crate) mod uploads;
