/// Types implementing BeanstalkSerialisable can be written to the Beanstalk
/// TCP connection in the client -> server direction.
pub trait BeanstalkSerialisable {
    /// Converts the value in question to a Beanstalk command.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
