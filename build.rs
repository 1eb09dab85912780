use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=WIN_PTHREADS");
    // opencv on windows links against an external pthreads build
    if let Ok(pthreads_win) = env::var("WIN_PTHREADS") {
        println!("cargo:rustc-link-search=native={}", pthreads_win);
    }
}
