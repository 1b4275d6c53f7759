//! Positioned (pread/pwrite-style) file I/O, used instead of seek+read/write
//! so concurrent readers against the same open file never race each
//! other's cursor.

use std::fs::File;
use std::io;

#[cfg(unix)]
pub fn pread(file: &File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + filled as u64)? {
            0 => {
                buf.truncate(filled);
                break;
            }
            n => filled += n,
        }
    }
    Ok(buf)
}

#[cfg(unix)]
pub fn pwrite(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
pub fn pread(file: &File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    use std::os::windows::fs::FileExt;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match file.seek_read(&mut buf[filled..], offset + filled as u64)? {
            0 => {
                buf.truncate(filled);
                break;
            }
            n => filled += n,
        }
    }
    Ok(buf)
}

#[cfg(windows)]
pub fn pwrite(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < data.len() {
        let n = file.seek_write(&data[written..], offset + written as u64)?;
        written += n;
    }
    Ok(())
}
