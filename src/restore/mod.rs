pub(crate) mod db_restore;
mod logic;
