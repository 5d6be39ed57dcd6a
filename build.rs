fn main() {
    if !cfg!(target_os = "linux") {
        panic!(
            "{} only works with linux (i915 debugger interface)",
            env!("CARGO_PKG_NAME")
        );
    }
}
