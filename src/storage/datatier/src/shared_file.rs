use super::*;

/// Storage that lives in a file mapped with `MAP_SHARED`. Every process which
/// opens the same path maps the same pages, so when the file lives on a tmpfs
/// such as `/dev/shm` this is a named shared memory segment. The segment
/// outlives the processes which map it and is only removed by deleting the
/// file.
///
/// Creation and attachment are serialized with an advisory lock on the file.
/// The header is written only after the data region was initialized, so a
/// creator which dies part way leaves behind a segment that fails validation
/// rather than one that looks valid.
pub struct SharedFile {
    mmap: MmapMut,
    data: Range<usize>,
    created: bool,
    // device and inode of the backing file
    identity: (u64, u64),
}

impl SharedFile {
    /// Open the segment at the given path, creating it if `create` is set and
    /// the file does not exist yet.
    ///
    /// When the segment is created, the file is sized to hold `data_size`
    /// bytes after the header and `init` is called with the zeroed data
    /// region before the header is published. If `init` fails the file is
    /// truncated back to zero length so that a later open starts over.
    ///
    /// When attaching to an existing segment, `data_size` is ignored in favor
    /// of the size recorded in the header, and the header is checked against
    /// `user_version`.
    ///
    /// Returns an error with kind `NotFound` if the file does not exist, or is
    /// empty, and `create` is not set, `TimedOut` if the file lock could not be taken
    /// within `timeout`, and `InvalidData` if the segment fails validation.
    pub fn open<T, F>(
        path: T,
        data_size: usize,
        user_version: u64,
        create: bool,
        timeout: Duration,
        init: F,
    ) -> Result<Self, std::io::Error>
    where
        T: AsRef<Path>,
        F: FnOnce(&mut [u8]) -> Result<(), std::io::Error>,
    {
        let path = path.as_ref();
        let deadline = Instant::now() + timeout;

        let (file, identity) = open_locked(path, create, deadline)?;

        // the attachment is counted before the lock is released so that a
        // concurrent destroy never misses it
        let result = Self::attach(&file, data_size, user_version, create, identity, init)
            .map(|segment| {
                let attached = segment.header().attached.fetch_add(1, Ordering::AcqRel) + 1;
                (segment, attached)
            });
        unlock(&file);

        let (segment, attached) = result?;
        debug!(
            "{} segment {} with {} bytes of data, {} attached",
            if segment.created { "created" } else { "attached" },
            path.display(),
            segment.data.end - segment.data.start,
            attached,
        );

        Ok(segment)
    }

    // must be called while holding the file lock
    fn attach<F: FnOnce(&mut [u8]) -> Result<(), std::io::Error>>(
        file: &File,
        data_size: usize,
        user_version: u64,
        create: bool,
        identity: (u64, u64),
        init: F,
    ) -> Result<Self, std::io::Error> {
        let len = file.metadata()?.len() as usize;

        if len == 0 {
            // an empty file is left behind by a create which failed or died
            // before sizing the file, it holds no segment
            if !create {
                return Err(Error::new(
                    ErrorKind::NotFound,
                    "segment was never initialized",
                ));
            }

            let total_size = total_size(data_size);

            // grow the file to match the total size, the new pages are zeroed
            file.set_len(total_size as u64)?;

            let mut mmap = unsafe { MmapOptions::new().populate().map_mut(file)? };

            // data resides after the header
            let data = Range {
                start: HEADER_SIZE,
                end: HEADER_SIZE + data_size,
            };

            if let Err(e) = init(&mut mmap[data.start..data.end]) {
                drop(mmap);
                let _ = file.set_len(0);
                return Err(e);
            }

            let header = Header::new(data_size, user_version);

            // write the header to the file using memcpy
            // SAFETY: we know the source is exactly HEADER_SIZE and that the
            // destination is at least as large. We also know that they are both
            // properly aligned and do not overlap.
            unsafe {
                let src = header.as_bytes().as_ptr();
                let dst = mmap.as_mut_ptr();
                std::ptr::copy_nonoverlapping(src, dst, HEADER_SIZE);
            }

            return Ok(Self {
                mmap,
                data,
                created: true,
                identity,
            });
        }

        if len < HEADER_SIZE {
            return Err(Error::new(ErrorKind::InvalidData, "segment is truncated"));
        }

        let mmap = unsafe { MmapOptions::new().populate().map_mut(file)? };

        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long
        let header = unsafe { &*(mmap.as_ptr() as *const Header) };
        header.check(user_version)?;

        let data_size = header.data_size();
        if total_size(data_size) != len {
            return Err(Error::new(ErrorKind::InvalidData, "segment size mismatch"));
        }

        Ok(Self {
            mmap,
            data: Range {
                start: HEADER_SIZE,
                end: HEADER_SIZE + data_size,
            },
            created: false,
            identity,
        })
    }

    /// Removes the backing file. Processes which still have the segment mapped
    /// keep their mapping, new opens will create a fresh segment.
    pub fn remove<T: AsRef<Path>>(path: T) -> Result<(), std::io::Error> {
        std::fs::remove_file(path)
    }

    /// Removes the backing file if no other handle is attached to this
    /// segment, and returns the number of other attachments. Nothing is
    /// removed unless that number is zero.
    ///
    /// The check and the removal happen under the file lock, so an open which
    /// is waiting on the lock notices the removal and starts a fresh segment
    /// rather than attaching to this one. If the path no longer refers to
    /// this segment it is left alone.
    pub fn destroy<T: AsRef<Path>>(&self, path: T, timeout: Duration) -> Result<u64, std::io::Error> {
        let path = path.as_ref();
        let deadline = Instant::now() + timeout;

        let file = match OpenOptions::new().read(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        lock(&file, deadline)?;
        let result = file.metadata().and_then(|locked| {
            let linked = match std::fs::metadata(path) {
                Ok(metadata) => Some(identity(&metadata)),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            if identity(&locked) != self.identity || linked != Some(self.identity) {
                debug!("{} was replaced, not removing it", path.display());
                return Ok(0);
            }
            let others = self.attached().saturating_sub(1);
            if others == 0 {
                std::fs::remove_file(path)?;
            }
            Ok(others)
        });
        unlock(&file);

        result
    }

    pub fn header(&self) -> &Header {
        // SAFETY: the mapping is page aligned and begins with a header which
        // was either written or validated when the segment was opened
        unsafe { &*(self.mmap.as_ptr() as *const Header) }
    }

    /// Returns true if this handle created the segment.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Number of live attachments across all processes, including this one.
    pub fn attached(&self) -> u64 {
        self.header().attached()
    }

    pub fn time_unix_s(&self) -> u32 {
        self.header().time_unix_s()
    }
}

impl Drop for SharedFile {
    fn drop(&mut self) {
        let _ = self
            .header()
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

impl Datapool for SharedFile {
    fn as_slice(&self) -> &[u8] {
        &self.mmap[self.data.start..self.data.end]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[self.data.start..self.data.end]
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.mmap.flush()
    }
}

/// Opens the file and takes its lock. If the file was removed while waiting
/// for the lock it is opened again, so the returned file is always the one
/// the path refers to.
fn open_locked(path: &Path, create: bool, deadline: Instant) -> Result<(File, (u64, u64)), Error> {
    loop {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .mode(0o644)
            .open(path)?;

        lock(&file, deadline)?;

        // dropping the file on any return below releases the lock
        let locked = identity(&file.metadata()?);
        match std::fs::metadata(path) {
            Ok(metadata) if identity(&metadata) == locked => return Ok((file, locked)),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        trace!("{} was removed while waiting, reopening", path.display());

        if Instant::now() >= deadline {
            return Err(Error::new(
                ErrorKind::TimedOut,
                "timed out waiting for segment lock",
            ));
        }
    }
}

fn identity(metadata: &Metadata) -> (u64, u64) {
    (metadata.dev(), metadata.ino())
}

fn lock(file: &File, deadline: Instant) -> Result<(), std::io::Error> {
    loop {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            return Ok(());
        }
        let e = Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) => {}
            _ => return Err(e),
        }
        if Instant::now() >= deadline {
            return Err(Error::new(
                ErrorKind::TimedOut,
                "timed out waiting for segment lock",
            ));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn unlock(file: &File) {
    // closing the file would release the lock as well
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}
