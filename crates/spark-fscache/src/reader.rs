use std::io::{self, Read, Seek, SeekFrom};

use crate::chunk::FileChunk;

/// 把有序的多个字节切片呈现为一个可读、可定位的流。
///
/// 读路径用它把一组块描述符拼成上传请求体或读请求的应答，不复制、不缓冲任何数据。
/// 定位时从头线性扫描重新确定切片下标与片内偏移；切片数量通常很少，这里不是性能热点。
#[derive(Debug, Clone)]
pub struct MultiSliceReader<S> {
    slices: Vec<S>,
    index: usize,
    slice_pos: usize,
    pos: u64,
    len: u64,
}

impl<S: AsRef<[u8]>> MultiSliceReader<S> {
    pub fn new(slices: Vec<S>) -> Self {
        let len = slices.iter().map(|s| s.as_ref().len() as u64).sum();
        Self {
            slices,
            index: 0,
            slice_pos: 0,
            pos: 0,
            len,
        }
    }

    /// 所有切片的总字节数。
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前读位置。
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl<'a> MultiSliceReader<&'a [u8]> {
    /// 以块描述符的数据视图构造读取器。
    pub fn from_chunks(chunks: &'a [FileChunk]) -> Self {
        Self::new(chunks.iter().map(FileChunk::data).collect())
    }
}

impl<S: AsRef<[u8]>> Read for MultiSliceReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.index < self.slices.len() {
            let slice = &self.slices[self.index].as_ref()[self.slice_pos..];
            let n = slice.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&slice[..n]);
            written += n;
            self.slice_pos += n;
            self.pos += n as u64;
            if self.slice_pos >= self.slices[self.index].as_ref().len() {
                self.index += 1;
                self.slice_pos = 0;
            }
        }
        Ok(written)
    }
}

impl<S: AsRef<[u8]>> Seek for MultiSliceReader<S> {
    /// 目标位置被裁剪到 `[0, len]`，越界不会报错。
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let target = match target {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.len) + i128::from(delta),
        };
        let target = target.clamp(0, i128::from(self.len)) as u64;

        self.index = 0;
        self.slice_pos = 0;
        self.pos = 0;
        while self.pos < target {
            let slice_len = self.slices[self.index].as_ref().len() as u64;
            if self.pos + slice_len <= target {
                self.pos += slice_len;
                self.index += 1;
            } else {
                self.slice_pos = (target - self.pos) as usize;
                self.pos = target;
            }
        }
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slices_are_skipped_transparently() {
        let mut reader = MultiSliceReader::new(vec![&b""[..], &b"ab"[..], &b""[..], &b"c"[..]]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("读取全部");
        assert_eq!(out, b"abc");

        assert_eq!(reader.seek(SeekFrom::Start(2)).expect("定位"), 2);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).expect("读取剩余");
        assert_eq!(rest, b"c");
    }

    #[test]
    fn small_destination_stops_mid_slice() {
        let mut reader = MultiSliceReader::new(vec![b"hello".to_vec(), b"world".to_vec()]);
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).expect("第一次读取"), 3);
        assert_eq!(&buf, b"hel");
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).expect("跨越切片边界"), 4);
        assert_eq!(&buf, b"lowo");
        assert_eq!(reader.position(), 7);
    }
}
