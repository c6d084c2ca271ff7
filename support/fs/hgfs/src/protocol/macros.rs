// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Defines a struct to hold an HGFS request's fields.
macro_rules! hgfs_message_struct {
    ($( $num:literal $name:ident $($field_name:ident [$field_type:tt] )* ;)*) => {
        $(
            // The struct holds the reader it was created from for two reasons:
            // 1. Some operations (e.g. Write) need it to access the trailing
            //    payload bytes.
            // 2. It allows the lifetime 'a to be there unconditionally;
            //    otherwise, only some messages would need it and the macro
            //    can't easily filter on that.
            #[allow(dead_code)]
            pub struct $name<'a> {
                pub reader: crate::protocol::PacketReader<'a>,
                $(pub $field_name: hgfs_message_struct!(@to_type $field_type),)*
            }

            // Create a message from a packet reader.
            impl<'a> TryFrom<crate::protocol::PacketReader<'a>> for $name<'a> {
                type Error = crate::OpError;

                hgfs_message_struct!(@try_from $name $($field_name [$field_type])*);
            }

            // Custom Debug trait because the reader field must be excluded.
            impl<'a> std::fmt::Debug for $name<'a> {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.debug_struct(stringify!($name))
                    $(
                        .field(stringify!($field_name), &self.$field_name)
                    )*
                        .finish()
                }
            }
        )*
    };

    // Convert size to the field type.
    (@to_type 1) => { u8 };
    (@to_type 2) => { u16 };
    (@to_type 4) => { u32 };
    (@to_type 8) => { u64 };
    (@to_type c) => { &'a [u8] };
    (@to_type a1) => { crate::protocol::AttrV1 };
    (@to_type a2) => { crate::protocol::AttrV2 };

    // Convert size to the associated reader method.
    (@to_read $name:ident 1) => { $name.u8()? };
    (@to_read $name:ident 2) => { $name.u16()? };
    (@to_read $name:ident 4) => { $name.u32()? };
    (@to_read $name:ident 8) => { $name.u64()? };
    (@to_read $name:ident c) => { $name.cp_name()? };
    (@to_read $name:ident a1) => { $name.attr_v1()? };
    (@to_read $name:ident a2) => { $name.attr_v2()? };

    // Generate the try_from method for a message with fields.
    (@try_from $name:ident $($field_name:ident [$field_type:tt] )+) => {
        fn try_from(mut reader: crate::protocol::PacketReader<'a>) -> crate::Result<$name<'a>> {
            $(
                let $field_name = hgfs_message_struct!(@to_read reader $field_type);
            )+
            Ok($name {
                reader,
                $(
                    $field_name,
                )+
            })
        }
    };

    // The case of a message with no fields must be handled separately so the
    // compiler doesn't complain about an unnecessary "mut" on the argument.
    (@try_from $name:ident) => {
        fn try_from(reader: crate::protocol::PacketReader<'a>) -> crate::Result<$name<'a>> {
            Ok($name {
                reader,
            })
        }
    };
}

// Generate the HgfsRequest enum.
macro_rules! hgfs_message_enum {
    ($( $num:literal $name:ident $($field_name:ident [$field_type:tt] )* ;)*) => {
        #[derive(Debug)]
        pub enum HgfsRequest<'a> {
            $($name($name<'a>),)*
        }

        impl<'a> HgfsRequest<'a> {
            // Create an HgfsRequest for the specified opcode, reading the
            // fields from the reader.
            pub fn read(opcode: u32, reader: crate::protocol::PacketReader<'a>) -> crate::Result<HgfsRequest<'a>> {
                let message = match opcode {
                    $($num => HgfsRequest::$name(reader.try_into()?),)*
                    _ => {
                        tracing::warn!(opcode, "unknown request opcode");
                        return Err(crate::OpError::Protocol)
                    }
                };

                Ok(message)
            }
        }
    };
}

// Generate structs and an enum to represent HGFS request messages.
macro_rules! hgfs_request_messages {
    ($($contents:tt)*) => {
        hgfs_message_struct!($($contents)*);
        hgfs_message_enum!($($contents)*);
    }
}
