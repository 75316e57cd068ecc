mod scenarios;
mod test_ctx;

use msvcrt_seh::{get_version, set_debug};

fn main() {
    set_debug(test_ctx::env_flag("SEH_TEST_DEBUG"));
    println!("{}", get_version());
    scenarios::run_all();
    println!("seh_test all scenarios passed");
}
