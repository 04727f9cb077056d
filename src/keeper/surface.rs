use crate::keeper::aggregators::{all_and, concat, merge, pass};
use crate::keeper::{Keeper, KeeperError, MethodClass};

/// Register the standard online-model serving surface. Built once at
/// startup; the routing and fold assignments never change afterwards.
pub fn register_standard_surface(k: &mut Keeper) -> Result<(), KeeperError> {
  k.register_broadcast("set_config", MethodClass::Update, all_and)?;
  k.register_random("get_config", MethodClass::Analysis)?;
  k.register_cht("clear_row", 2, MethodClass::Update, all_and)?;
  k.register_random("get_id", MethodClass::Analysis)?;
  k.register_cht("update", 2, MethodClass::Update, pass)?;
  k.register_broadcast("clear", MethodClass::Update, all_and)?;
  k.register_random("calc_score", MethodClass::Analysis)?;
  k.register_broadcast("get_all_rows", MethodClass::Analysis, concat)?;
  k.register_broadcast("save", MethodClass::Update, all_and)?;
  k.register_broadcast("load", MethodClass::Update, all_and)?;
  k.register_broadcast("get_status", MethodClass::Analysis, merge)?;
  Ok(())
}
