pub mod archive_day;
pub mod archive_events;
pub mod archive_month;
pub mod device_list;
pub mod discover;
pub mod identify;
pub mod logoff;
pub mod logon;
pub mod read_data;
