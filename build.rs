fn main() {
    // The tables this crate reads only exist on linux kernels
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    compile_error!("Building pagemap for an unsupported platform. Currently only linux and android are supported")
}
