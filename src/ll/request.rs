//! Low-level filesystem operation request.
//!
//! A request represents one transaction pulled off a virtio-fs queue: a
//! `fuse_in_header` followed by opcode-specific arguments.

use std::convert::TryFrom;
use std::{error, fmt, mem};

use crate::ll::fuse_abi::{fuse_in_header, fuse_opcode, InvalidOpcodeError};

use super::argument::Arguments;

/// Error that may occur while parsing a request off the queue.
#[derive(Debug)]
pub enum RequestError {
    /// Not enough data for the request header.
    ShortHeader(usize),
    /// The guest kernel requested an unknown operation.
    UnknownOpcode(u32),
    /// Not enough data for arguments (short request).
    ShortRequest(usize, usize),
    /// Insufficient argument data.
    InsufficientData,
    /// The HAL handed over a request buffer without 8-byte alignment.
    UnalignedBuffer,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortHeader(len) => write!(
                f,
                "short FUSE request header ({} < {})",
                len,
                mem::size_of::<fuse_in_header>()
            ),
            RequestError::UnknownOpcode(opcode) => write!(f, "unknown FUSE opcode ({opcode})"),
            RequestError::ShortRequest(len, total) => {
                write!(f, "short FUSE request ({len} < {total})")
            }
            RequestError::InsufficientData => write!(f, "insufficient argument data"),
            RequestError::UnalignedBuffer => write!(f, "request buffer is not 8-byte aligned"),
        }
    }
}

impl error::Error for RequestError {}

pub mod op {
    use std::ffi::OsStr;

    use crate::ll::fuse_abi::*;

    #[derive(Debug)]
    pub struct Lookup<'a> {
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Forget<'a> {
        pub arg: &'a fuse_forget_in,
    }
    #[derive(Debug)]
    pub struct BatchForget<'a> {
        pub nodes: &'a [fuse_forget_one],
    }
    #[derive(Debug)]
    pub struct GetAttr<'a> {
        pub arg: &'a fuse_getattr_in,
    }
    #[derive(Debug)]
    pub struct SetAttr<'a> {
        pub arg: &'a fuse_setattr_in,
    }
    #[derive(Debug)]
    pub struct ReadLink();
    #[derive(Debug)]
    pub struct SymLink<'a> {
        pub name: &'a OsStr,
        pub target: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct MkNod<'a> {
        pub arg: &'a fuse_mknod_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct MkDir<'a> {
        pub arg: &'a fuse_mkdir_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Unlink<'a> {
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct RmDir<'a> {
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Rename<'a> {
        pub newdir: u64,
        pub flags: u32,
        pub name: &'a OsStr,
        pub newname: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Link<'a> {
        pub arg: &'a fuse_link_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Open<'a> {
        pub arg: &'a fuse_open_in,
    }
    #[derive(Debug)]
    pub struct Read<'a> {
        pub arg: &'a fuse_read_in,
    }
    #[derive(Debug)]
    pub struct Write<'a> {
        pub arg: &'a fuse_write_in,
        pub data: &'a [u8],
    }
    #[derive(Debug)]
    pub struct StatFs();
    #[derive(Debug)]
    pub struct Release<'a> {
        pub arg: &'a fuse_release_in,
    }
    #[derive(Debug)]
    pub struct FSync<'a> {
        pub arg: &'a fuse_fsync_in,
    }
    #[derive(Debug)]
    pub struct Flush<'a> {
        pub arg: &'a fuse_flush_in,
    }
    #[derive(Debug)]
    pub struct Init<'a> {
        pub arg: &'a fuse_init_in,
    }
    #[derive(Debug)]
    pub struct OpenDir<'a> {
        pub arg: &'a fuse_open_in,
    }
    #[derive(Debug)]
    pub struct ReadDir<'a> {
        pub arg: &'a fuse_read_in,
    }
    #[derive(Debug)]
    pub struct ReleaseDir<'a> {
        pub arg: &'a fuse_release_in,
    }
    #[derive(Debug)]
    pub struct FSyncDir<'a> {
        pub arg: &'a fuse_fsync_in,
    }
    #[derive(Debug)]
    pub struct GetLk<'a> {
        pub arg: &'a fuse_lk_in,
    }
    #[derive(Debug)]
    pub struct SetLk<'a> {
        pub arg: &'a fuse_lk_in,
        pub sleep: bool,
    }
    #[derive(Debug)]
    pub struct Access<'a> {
        pub arg: &'a fuse_access_in,
    }
    #[derive(Debug)]
    pub struct Create<'a> {
        pub arg: &'a fuse_create_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Interrupt<'a> {
        pub arg: &'a fuse_interrupt_in,
    }
    #[derive(Debug)]
    pub struct FAllocate<'a> {
        pub arg: &'a fuse_fallocate_in,
    }
    #[derive(Debug)]
    pub struct ReadDirPlus<'a> {
        pub arg: &'a fuse_read_in,
    }
    #[derive(Debug)]
    pub struct Lseek<'a> {
        pub arg: &'a fuse_lseek_in,
    }
    #[derive(Debug)]
    pub struct Destroy();
}
use op::*;

/// Filesystem operation (and arguments) the guest kernel wants us to
/// perform. Opcodes this server has no handler for (the xattr family,
/// ioctl, poll, bmap, copy_file_range, notify_reply) decode to
/// [`Operation::Unsupported`] and are answered with `ENOSYS`.
#[derive(Debug)]
pub enum Operation<'a> {
    Lookup(Lookup<'a>),
    Forget(Forget<'a>),
    BatchForget(BatchForget<'a>),
    GetAttr(GetAttr<'a>),
    SetAttr(SetAttr<'a>),
    ReadLink(ReadLink),
    SymLink(SymLink<'a>),
    MkNod(MkNod<'a>),
    MkDir(MkDir<'a>),
    Unlink(Unlink<'a>),
    RmDir(RmDir<'a>),
    Rename(Rename<'a>),
    Link(Link<'a>),
    Open(Open<'a>),
    Read(Read<'a>),
    Write(Write<'a>),
    StatFs(StatFs),
    Release(Release<'a>),
    FSync(FSync<'a>),
    Flush(Flush<'a>),
    Init(Init<'a>),
    OpenDir(OpenDir<'a>),
    ReadDir(ReadDir<'a>),
    ReleaseDir(ReleaseDir<'a>),
    FSyncDir(FSyncDir<'a>),
    GetLk(GetLk<'a>),
    SetLk(SetLk<'a>),
    Access(Access<'a>),
    Create(Create<'a>),
    Interrupt(Interrupt<'a>),
    FAllocate(FAllocate<'a>),
    ReadDirPlus(ReadDirPlus<'a>),
    Lseek(Lseek<'a>),
    Destroy(Destroy),
    Unsupported(fuse_opcode),
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Lookup(x) => write!(f, "LOOKUP name {:?}", x.name),
            Operation::Forget(x) => write!(f, "FORGET nlookup {}", x.arg.nlookup),
            Operation::BatchForget(x) => write!(f, "BATCH_FORGET nodes {}", x.nodes.len()),
            Operation::GetAttr(x) => write!(f, "GETATTR flags {:#x}", x.arg.getattr_flags),
            Operation::SetAttr(x) => write!(f, "SETATTR valid {:#x}", x.arg.valid),
            Operation::ReadLink(_) => write!(f, "READLINK"),
            Operation::SymLink(x) => {
                write!(f, "SYMLINK name {:?}, target {:?}", x.name, x.target)
            }
            Operation::MkNod(x) => write!(
                f,
                "MKNOD name {:?}, mode {:#05o}, rdev {}",
                x.name, x.arg.mode, x.arg.rdev
            ),
            Operation::MkDir(x) => {
                write!(f, "MKDIR name {:?}, mode {:#05o}", x.name, x.arg.mode)
            }
            Operation::Unlink(x) => write!(f, "UNLINK name {:?}", x.name),
            Operation::RmDir(x) => write!(f, "RMDIR name {:?}", x.name),
            Operation::Rename(x) => write!(
                f,
                "RENAME name {:?}, newdir {:#018x}, newname {:?}, flags {:#x}",
                x.name, x.newdir, x.newname, x.flags
            ),
            Operation::Link(x) => {
                write!(f, "LINK name {:?}, oldnodeid {:#018x}", x.name, x.arg.oldnodeid)
            }
            Operation::Open(x) => write!(f, "OPEN flags {:#x}", x.arg.flags),
            Operation::Read(x) => write!(
                f,
                "READ fh {}, offset {}, size {}",
                x.arg.fh, x.arg.offset, x.arg.size
            ),
            Operation::Write(x) => write!(
                f,
                "WRITE fh {}, offset {}, size {}, write flags {:#x}",
                x.arg.fh, x.arg.offset, x.arg.size, x.arg.write_flags
            ),
            Operation::StatFs(_) => write!(f, "STATFS"),
            Operation::Release(x) => write!(
                f,
                "RELEASE fh {}, flags {:#x}, release flags {:#x}",
                x.arg.fh, x.arg.flags, x.arg.release_flags
            ),
            Operation::FSync(x) => {
                write!(f, "FSYNC fh {}, fsync flags {:#x}", x.arg.fh, x.arg.fsync_flags)
            }
            Operation::Flush(x) => {
                write!(f, "FLUSH fh {}, lock owner {}", x.arg.fh, x.arg.lock_owner)
            }
            Operation::Init(x) => write!(
                f,
                "INIT kernel ABI {}.{}, flags {:#x}, max readahead {}",
                x.arg.major, x.arg.minor, x.arg.flags, x.arg.max_readahead
            ),
            Operation::OpenDir(x) => write!(f, "OPENDIR flags {:#x}", x.arg.flags),
            Operation::ReadDir(x) => write!(
                f,
                "READDIR fh {}, offset {}, size {}",
                x.arg.fh, x.arg.offset, x.arg.size
            ),
            Operation::ReleaseDir(x) => {
                write!(f, "RELEASEDIR fh {}, flags {:#x}", x.arg.fh, x.arg.flags)
            }
            Operation::FSyncDir(x) => write!(
                f,
                "FSYNCDIR fh {}, fsync flags {:#x}",
                x.arg.fh, x.arg.fsync_flags
            ),
            Operation::GetLk(x) => write!(f, "GETLK fh {}, lock owner {}", x.arg.fh, x.arg.owner),
            Operation::SetLk(x) => write!(
                f,
                "SETLK fh {}, lock owner {}, sleep {}",
                x.arg.fh, x.arg.owner, x.sleep
            ),
            Operation::Access(x) => write!(f, "ACCESS mask {:#05o}", x.arg.mask),
            Operation::Create(x) => write!(
                f,
                "CREATE name {:?}, mode {:#05o}, flags {:#x}",
                x.name, x.arg.mode, x.arg.flags
            ),
            Operation::Interrupt(x) => write!(f, "INTERRUPT unique {}", x.arg.unique),
            Operation::FAllocate(x) => write!(
                f,
                "FALLOCATE fh {}, offset {}, length {}",
                x.arg.fh, x.arg.offset, x.arg.length
            ),
            Operation::ReadDirPlus(x) => write!(
                f,
                "READDIRPLUS fh {}, offset {}, size {}",
                x.arg.fh, x.arg.offset, x.arg.size
            ),
            Operation::Lseek(x) => write!(
                f,
                "LSEEK fh {}, offset {}, whence {}",
                x.arg.fh, x.arg.offset, x.arg.whence
            ),
            Operation::Destroy(_) => write!(f, "DESTROY"),
            Operation::Unsupported(op) => write!(f, "unsupported opcode {op:?}"),
        }
    }
}

impl<'a> Operation<'a> {
    fn parse(opcode: fuse_opcode, args: &mut Arguments<'a>) -> Result<Self, RequestError> {
        Ok(match opcode {
            fuse_opcode::FUSE_LOOKUP => Operation::Lookup(Lookup { name: args.name()? }),
            fuse_opcode::FUSE_FORGET => Operation::Forget(Forget { arg: args.arg()? }),
            fuse_opcode::FUSE_BATCH_FORGET => {
                let arg: &crate::ll::fuse_abi::fuse_batch_forget_in = args.arg()?;
                Operation::BatchForget(BatchForget {
                    nodes: args.arg_slice(arg.count as usize)?,
                })
            }
            fuse_opcode::FUSE_GETATTR => Operation::GetAttr(GetAttr { arg: args.arg()? }),
            fuse_opcode::FUSE_SETATTR => Operation::SetAttr(SetAttr { arg: args.arg()? }),
            fuse_opcode::FUSE_READLINK => Operation::ReadLink(ReadLink()),
            fuse_opcode::FUSE_SYMLINK => Operation::SymLink(SymLink {
                name: args.name()?,
                target: args.name()?,
            }),
            fuse_opcode::FUSE_MKNOD => Operation::MkNod(MkNod {
                arg: args.arg()?,
                name: args.name()?,
            }),
            fuse_opcode::FUSE_MKDIR => Operation::MkDir(MkDir {
                arg: args.arg()?,
                name: args.name()?,
            }),
            fuse_opcode::FUSE_UNLINK => Operation::Unlink(Unlink { name: args.name()? }),
            fuse_opcode::FUSE_RMDIR => Operation::RmDir(RmDir { name: args.name()? }),
            fuse_opcode::FUSE_RENAME => {
                let arg: &crate::ll::fuse_abi::fuse_rename_in = args.arg()?;
                Operation::Rename(Rename {
                    newdir: arg.newdir,
                    flags: 0,
                    name: args.name()?,
                    newname: args.name()?,
                })
            }
            fuse_opcode::FUSE_RENAME2 => {
                let arg: &crate::ll::fuse_abi::fuse_rename2_in = args.arg()?;
                Operation::Rename(Rename {
                    newdir: arg.newdir,
                    flags: arg.flags,
                    name: args.name()?,
                    newname: args.name()?,
                })
            }
            fuse_opcode::FUSE_LINK => Operation::Link(Link {
                arg: args.arg()?,
                name: args.name()?,
            }),
            fuse_opcode::FUSE_OPEN => Operation::Open(Open { arg: args.arg()? }),
            fuse_opcode::FUSE_READ => Operation::Read(Read { arg: args.arg()? }),
            fuse_opcode::FUSE_WRITE => Operation::Write(Write {
                arg: args.arg()?,
                data: args.take_rest(),
            }),
            fuse_opcode::FUSE_STATFS => Operation::StatFs(StatFs()),
            fuse_opcode::FUSE_RELEASE => Operation::Release(Release { arg: args.arg()? }),
            fuse_opcode::FUSE_FSYNC => Operation::FSync(FSync { arg: args.arg()? }),
            fuse_opcode::FUSE_FLUSH => Operation::Flush(Flush { arg: args.arg()? }),
            fuse_opcode::FUSE_INIT => Operation::Init(Init { arg: args.arg()? }),
            fuse_opcode::FUSE_OPENDIR => Operation::OpenDir(OpenDir { arg: args.arg()? }),
            fuse_opcode::FUSE_READDIR => Operation::ReadDir(ReadDir { arg: args.arg()? }),
            fuse_opcode::FUSE_RELEASEDIR => {
                Operation::ReleaseDir(ReleaseDir { arg: args.arg()? })
            }
            fuse_opcode::FUSE_FSYNCDIR => Operation::FSyncDir(FSyncDir { arg: args.arg()? }),
            fuse_opcode::FUSE_GETLK => Operation::GetLk(GetLk { arg: args.arg()? }),
            fuse_opcode::FUSE_SETLK => Operation::SetLk(SetLk {
                arg: args.arg()?,
                sleep: false,
            }),
            fuse_opcode::FUSE_SETLKW => Operation::SetLk(SetLk {
                arg: args.arg()?,
                sleep: true,
            }),
            fuse_opcode::FUSE_ACCESS => Operation::Access(Access { arg: args.arg()? }),
            fuse_opcode::FUSE_CREATE => Operation::Create(Create {
                arg: args.arg()?,
                name: args.name()?,
            }),
            fuse_opcode::FUSE_INTERRUPT => Operation::Interrupt(Interrupt { arg: args.arg()? }),
            fuse_opcode::FUSE_FALLOCATE => Operation::FAllocate(FAllocate { arg: args.arg()? }),
            fuse_opcode::FUSE_READDIRPLUS => {
                Operation::ReadDirPlus(ReadDirPlus { arg: args.arg()? })
            }
            fuse_opcode::FUSE_LSEEK => Operation::Lseek(Lseek { arg: args.arg()? }),
            fuse_opcode::FUSE_DESTROY => Operation::Destroy(Destroy()),
            fuse_opcode::FUSE_SETXATTR
            | fuse_opcode::FUSE_GETXATTR
            | fuse_opcode::FUSE_LISTXATTR
            | fuse_opcode::FUSE_REMOVEXATTR
            | fuse_opcode::FUSE_BMAP
            | fuse_opcode::FUSE_IOCTL
            | fuse_opcode::FUSE_POLL
            | fuse_opcode::FUSE_NOTIFY_REPLY
            | fuse_opcode::FUSE_COPY_FILE_RANGE => Operation::Unsupported(opcode),
        })
    }
}

/// One decoded transaction: header plus typed operation.
#[derive(Debug)]
pub struct Request<'a> {
    header: &'a fuse_in_header,
    operation: Operation<'a>,
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FUSE({:3}) ino {:#018x}: {}",
            self.header.unique, self.header.nodeid, self.operation
        )
    }
}

impl<'a> TryFrom<&'a [u8]> for Request<'a> {
    type Error = RequestError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        let data_len = data.len();
        let mut args = Arguments::new(data);
        // Every request begins with a fuse_in_header
        let header: &fuse_in_header = match args.arg() {
            Ok(header) => header,
            Err(RequestError::InsufficientData) => {
                return Err(RequestError::ShortHeader(data_len));
            }
            Err(err) => return Err(err),
        };
        let opcode = fuse_opcode::try_from(header.opcode)
            .map_err(|_: InvalidOpcodeError| RequestError::UnknownOpcode(header.opcode))?;
        if data_len < header.len as usize {
            return Err(RequestError::ShortRequest(data_len, header.len as usize));
        }
        let operation = Operation::parse(opcode, &mut args)?;
        Ok(Self { header, operation })
    }
}

impl<'a> Request<'a> {
    /// Returns the unique identifier of this request. It is reflected back
    /// into the reply header so the kernel can pair the transaction.
    #[inline]
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Returns the node id of the inode this request is targeted to.
    #[inline]
    pub fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    /// Returns the UID the requesting guest process runs under.
    #[inline]
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Returns the GID the requesting guest process runs under.
    #[inline]
    pub fn gid(&self) -> u32 {
        self.header.gid
    }

    /// Returns the filesystem operation (and its arguments) of this request.
    #[inline]
    pub fn operation(&self) -> &Operation<'_> {
        &self.operation
    }
}
