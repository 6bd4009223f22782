//! User program ELFs objcopy'd into the kernel image by the build.

extern "C" {
    static _binary_init_start: u8;
    static _binary_init_end: u8;
    static _binary_sh_start: u8;
    static _binary_sh_end: u8;
    static _binary_ls_start: u8;
    static _binary_ls_end: u8;
}

fn blob(start: &'static u8, end: &'static u8) -> &'static [u8] {
    let s = start as *const u8;
    let len = end as *const u8 as usize - s as usize;
    // SAFETY: the linker lays the blob out contiguously between the symbols.
    unsafe { core::slice::from_raw_parts(s, len) }
}

pub fn init() -> &'static [u8] {
    unsafe { blob(&_binary_init_start, &_binary_init_end) }
}

pub fn sh() -> &'static [u8] {
    unsafe { blob(&_binary_sh_start, &_binary_sh_end) }
}

pub fn ls() -> &'static [u8] {
    unsafe { blob(&_binary_ls_start, &_binary_ls_end) }
}
