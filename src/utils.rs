pub fn spin_forever() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
