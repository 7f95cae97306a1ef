#[cfg(test)]
mod harness;

#[cfg(test)]
mod store_test;

#[cfg(test)]
mod recovery_test;



#[cfg(test)]
mod move_test;

#[cfg(test)]
mod backpressure_test;
