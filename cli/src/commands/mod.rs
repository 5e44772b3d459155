mod helpers;
mod log;
mod meal;
mod queue;
mod setting;
mod status;

pub(crate) use log::{LogArgs, cmd_log};
pub(crate) use meal::{cmd_delete, cmd_meals, cmd_photo};
pub(crate) use queue::{cmd_queue, cmd_retry};
pub(crate) use setting::{cmd_setting_get, cmd_setting_list, cmd_setting_set};
pub(crate) use status::cmd_status;
