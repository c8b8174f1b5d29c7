use super::*;

/// A zeroed anonymous mapping. Only the creating process, and children forked
/// after creation, can see it, which makes it suitable for stores that are
/// private to one process.
pub struct Memory {
    mmap: MmapMut,
}

impl Memory {
    pub fn create(size: usize) -> Result<Self, std::io::Error> {
        if size == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "datapool must not be empty",
            ));
        }

        let mut mmap = MmapOptions::new().populate().len(size).map_anon()?;

        // touch every page up front so that the first operations on the pool
        // do not take page faults
        for page in mmap.chunks_mut(PAGE_SIZE) {
            page[0] = 0;
        }

        trace!("mapped anonymous datapool of {} bytes", size);

        Ok(Self { mmap })
    }
}

impl Datapool for Memory {
    fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        // nothing backs the mapping
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_datapool() {
        let mut datapool = Memory::create(2 * PAGE_SIZE + 1).expect("failed to create pool");
        assert_eq!(datapool.len(), 2 * PAGE_SIZE + 1);
        assert!(datapool.as_slice().iter().all(|b| *b == 0));

        datapool.as_mut_slice()[2 * PAGE_SIZE] = 0xAB;
        assert_eq!(datapool.as_slice()[2 * PAGE_SIZE], 0xAB);
        assert!(datapool.flush().is_ok());
    }

    #[test]
    fn empty_datapool() {
        assert_eq!(
            Memory::create(0).err().map(|e| e.kind()),
            Some(ErrorKind::InvalidInput)
        );
    }
}
