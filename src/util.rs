pub(crate) mod once;
