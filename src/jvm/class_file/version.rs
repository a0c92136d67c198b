use crate::jvm::class_file::{Deserialize, Serialize};
use crate::jvm::ClassFormatError;
use byteorder::{ReadBytesExt, WriteBytesExt};

/// Version of the class file, which is used to verify that the JVM has the
/// necessary features to interpret the class
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct Version {
    pub major_version: u16,
    pub minor_version: u16,
}

impl Version {
    /// Java SE 5, the last version verified by inference alone
    pub const JAVA5: Version = Version {
        major_version: 49,
        minor_version: 0,
    };

    /// Java SE 6, the first version that may carry `StackMapTable` attributes
    pub const JAVA6: Version = Version {
        major_version: 50,
        minor_version: 0,
    };

    /// JVM class file version corresponding to Java SE 8 (released March 2014)
    pub const JAVA8: Version = Version {
        major_version: 52,
        minor_version: 0,
    };

    /// Whether methods in this class carry (and need) stack map frames
    pub fn uses_stack_map_frames(&self) -> bool {
        *self >= Version::JAVA6
    }
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.minor_version.serialize(writer)?;
        self.major_version.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for Version {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, ClassFormatError> {
        let minor_version = u16::deserialize(reader)?;
        let major_version = u16::deserialize(reader)?;
        Ok(Version {
            major_version,
            minor_version,
        })
    }
}
